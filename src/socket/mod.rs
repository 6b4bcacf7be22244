// Public API modules
pub mod types;
pub mod options;

// Internal modules
mod shared;
mod connection;
mod worker_pool;

// Client implementations
mod blocking_client;
mod async_blocking_client;
mod callback_client;

// Server implementations
mod blocking_server;
mod reactor_server;

// Re-export public types
pub use types::{S9ClientListener, Lifecycle, Readiness, AcceptorKind};
pub use options::{Charset, ClientOptions, ServerOptions, TlsOptions, TrustStore};
pub use connection::{Connection, ConnectionId};

// Re-export client types
pub use blocking_client::S9BlockingClient;
pub use async_blocking_client::S9AsyncBlockingClient;
pub use callback_client::S9AsyncCallbackClient;

// Re-export server types
pub use blocking_server::S9BlockingServer;
pub use reactor_server::{S9ReactorServer, ReactorHandle, ConnectionInfo};
