//! Error types for S9 socket operations.
//!
//! This module provides a unified error type [`S9SocketError`] for everything that can go wrong
//! while constructing, starting or stopping clients and servers.
//!
//! Most I/O failures inside a running client or server never reach the caller as an error:
//! they are logged and turn into a connection teardown. What does reach the caller is mostly
//! argument validation and lifecycle misuse.
//!
//! # Examples
//!
//! ```no_run
//! use s9_socket::{ClientOptions, S9SocketError};
//!
//! # fn main() {
//! match ClientOptions::new("", 7000, "UTF-8") {
//!     Ok(options) => { /* use options */ },
//!     Err(S9SocketError::InvalidConfiguration(msg)) => {
//!         eprintln!("Invalid configuration: {}", msg);
//!     },
//!     Err(e) => {
//!         eprintln!("Unexpected error: {}", e);
//!     }
//! }
//! # }
//! ```

use std::fmt;
use std::net::TcpStream;

/// Error type for all S9 socket operations.
///
/// # Error Categories
///
/// - **Construction errors**: [`InvalidConfiguration`](Self::InvalidConfiguration)
/// - **Lifecycle errors**: [`InvalidState`](Self::InvalidState), [`PoolShutdown`](Self::PoolShutdown)
/// - **Connection errors**: [`ConnectionClosed`](Self::ConnectionClosed)
/// - **Runtime errors**: [`Tls`](Self::Tls), [`TlsHandshake`](Self::TlsHandshake), [`Io`](Self::Io)
#[derive(Debug)]
pub enum S9SocketError {
    /// Invalid construction argument was provided.
    ///
    /// This error occurs before any I/O is attempted, e.g. for:
    /// - An empty host or a port outside `1..=65535`
    /// - An unknown character set label
    /// - Zero-duration timeouts or a zero-sized read buffer
    ///
    /// # Example
    /// ```no_run
    /// use s9_socket::ClientOptions;
    ///
    /// # fn main() {
    /// // Port 0 is not a valid client port
    /// let result = ClientOptions::new("localhost", 0, "UTF-8");
    /// assert!(result.is_err());
    /// # }
    /// ```
    InvalidConfiguration(String),

    /// The operation is not allowed in the current lifecycle state.
    ///
    /// Clients and servers are one-shot: once stopped they cannot be started again.
    InvalidState(String),

    /// The peer closed the stream.
    ConnectionClosed,

    /// A task was submitted to a worker pool that has already been shut down.
    PoolShutdown,

    /// TLS connector setup failed, e.g. an unreadable trust store.
    Tls(native_tls::Error),

    /// The TLS handshake with the peer failed.
    TlsHandshake(String),

    /// An I/O operation failed.
    ///
    /// Timeouts surface here as well; they are not a distinguished kind.
    Io(std::io::Error),
}

impl fmt::Display for S9SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            S9SocketError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            S9SocketError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            S9SocketError::ConnectionClosed => write!(f, "Connection closed by peer"),
            S9SocketError::PoolShutdown => write!(f, "Worker pool already shut down"),
            S9SocketError::Tls(err) => write!(f, "TLS error: {}", err),
            S9SocketError::TlsHandshake(msg) => write!(f, "TLS handshake failed: {}", msg),
            S9SocketError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for S9SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            S9SocketError::Io(err) => Some(err),
            S9SocketError::Tls(err) => Some(err),
            _ => None,
        }
    }
}

// Convert from std::io::Error to S9SocketError error
impl From<std::io::Error> for S9SocketError {
    fn from(err: std::io::Error) -> Self {
        S9SocketError::Io(err)
    }
}

impl From<native_tls::Error> for S9SocketError {
    fn from(err: native_tls::Error) -> Self {
        S9SocketError::Tls(err)
    }
}

// A handshake interrupted by WouldBlock is only possible on non-blocking sockets,
// every handshake here runs in blocking mode so both cases are plain failures.
impl From<native_tls::HandshakeError<TcpStream>> for S9SocketError {
    fn from(err: native_tls::HandshakeError<TcpStream>) -> Self {
        match err {
            native_tls::HandshakeError::Failure(e) => S9SocketError::TlsHandshake(e.to_string()),
            native_tls::HandshakeError::WouldBlock(_) => {
                S9SocketError::TlsHandshake("handshake interrupted".to_string())
            }
        }
    }
}

/// Convenience type alias for `Result<T, S9SocketError>`.
///
/// # Examples
///
/// ```no_run
/// use s9_socket::{S9Result, ServerOptions, S9ReactorServer};
///
/// fn start_server() -> S9Result<S9ReactorServer> {
///     let mut server = S9ReactorServer::new(ServerOptions::new(7000, "UTF-8")?);
///     server.start()?;
///     Ok(server)
/// }
/// ```
pub type S9Result<T> = Result<T, S9SocketError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn io_errors_keep_their_source() {
        let err = S9SocketError::from(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(matches!(err, S9SocketError::Io(_)));
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "IO error: read timed out");
    }

    #[test]
    fn lifecycle_errors_have_no_source() {
        let err = S9SocketError::InvalidState("client already stopped".to_string());
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "Invalid state: client already stopped");
    }
}
