//! # Silver9 Socket
//!
//! TCP clients and servers over plain blocking sockets, a thread-per-connection
//! worker pool, and a single-threaded readiness reactor. Clients can optionally
//! run over TLS.
//!
//! Bytes are not framed: a message is whatever a single read returns.
//!
//! For more examples and documentation, see the [README on GitHub](https://github.com/AlexSilver9/s9_socket).

mod socket;
mod error;

pub use socket::*;
pub use error::{S9Result, S9SocketError};
