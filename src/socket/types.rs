use std::fmt;

// ============================================================================
// Macros
// ============================================================================

macro_rules! submit_or_log {
    ($pool:expr, $context:expr, $task:expr) => {
        if let Err(e) = $pool.submit($task) {
            tracing::error!("Failed to submit task {} to worker pool: {}", $context, e);
        }
    };
}

macro_rules! lock {
    ($mutex:expr) => {
        $mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    };
}

pub(crate) use submit_or_log;
pub(crate) use lock;

// ============================================================================
// Public API Types
// ============================================================================

/// Callbacks of the [`S9AsyncCallbackClient`](crate::S9AsyncCallbackClient).
///
/// All callbacks run on the client's background threads.
pub trait S9ClientListener: Send {
    fn on_connected(&mut self, remote_address: &str) {
        // Default: noop
        let _ = remote_address;
    }
    fn on_data_received(&mut self, data: &str);
    fn on_disconnected(&mut self);
    fn on_error(&mut self, error: String);
}

/// One-shot lifecycle of clients and servers.
///
/// `Created → Running → Stopped`. A stopped component cannot be started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Created => f.write_str("created"),
            Lifecycle::Running => f.write_str("running"),
            Lifecycle::Stopped => f.write_str("stopped"),
        }
    }
}

/// Interest set of a reactor connection. Always exactly one of read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Read,
    Write,
}

impl Readiness {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Readiness::Read => 0,
            Readiness::Write => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        if value == 1 { Readiness::Write } else { Readiness::Read }
    }

    pub(crate) fn interest(self) -> mio::Interest {
        match self {
            Readiness::Read => mio::Interest::READABLE,
            Readiness::Write => mio::Interest::WRITABLE,
        }
    }
}

/// Which listening socket implementation the thread-per-connection server uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptorKind {
    /// `std::net::TcpListener`
    #[default]
    Stream,
    /// A blocking `socket2::Socket` with address reuse and an explicit backlog
    Channel,
}
