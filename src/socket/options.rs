use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use encoding_rs::Encoding;
use crate::error::{S9Result, S9SocketError};

// ============================================================================
// Defaults
// ============================================================================

/// Connect and read timeout used by every blocking variant unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound of a single read, and therefore of a single message.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Sleep between empty reads of the callback client's receive loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_BACKLOG: i32 = 128;

// ============================================================================
// Charset
// ============================================================================

/// A named character set used to encode outgoing text and decode received bytes.
///
/// Labels follow the WHATWG encoding standard, so `"UTF-8"`, `"utf8"`, `"EUC-KR"`
/// and `"ISO-8859-1"` are all accepted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Charset(&'static Encoding);

impl Charset {
    /// Looks up a character set by label.
    pub fn for_label(label: &str) -> S9Result<Self> {
        if label.trim().is_empty() {
            return Err(S9SocketError::InvalidConfiguration("Charset cannot be empty".to_string()));
        }
        Encoding::for_label(label.trim().as_bytes())
            .map(Charset)
            .ok_or_else(|| S9SocketError::InvalidConfiguration(format!("Unknown charset: {}", label)))
    }

    /// The charset received bytes are decoded with when no charset applies.
    pub fn platform_default() -> Self {
        Charset(encoding_rs::UTF_8)
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Encodes text, replacing unmappable characters with numeric character references.
    pub fn encode<'a>(&self, text: &'a str) -> Cow<'a, [u8]> {
        let (bytes, _, _) = self.0.encode(text);
        bytes
    }

    /// Decodes bytes, replacing malformed sequences with U+FFFD.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        let (text, _) = self.0.decode_without_bom_handling(bytes);
        text
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Charset").field(&self.name()).finish()
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// TLS options
// ============================================================================

/// Extra trust material for TLS connections.
///
/// Without a password the file is read as PEM (one or more certificates) or a single DER
/// certificate and added as a trusted root. With a password the file is read as a PKCS#12
/// archive and presented as the client identity during the handshake.
#[derive(Debug, Clone)]
pub struct TrustStore {
    pub(crate) path: PathBuf,
    pub(crate) password: Option<String>,
}

impl TrustStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// TLS configuration for clients.
///
/// With no trust store the platform's default trust store is used.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub(crate) trust_store: Option<TrustStore>,
    pub(crate) domain: Option<String>,
}

impl TlsOptions {
    /// Creates a new `TlsOptions` builder using the platform trust store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given trust store in addition to the platform roots.
    pub fn trust_store(mut self, trust_store: TrustStore) -> Self {
        self.trust_store = Some(trust_store);
        self
    }

    /// Overrides the name the server certificate is verified against.
    /// Defaults to the connection host.
    pub fn domain(mut self, domain: impl Into<String>) -> S9Result<Self> {
        let domain = domain.into();
        if domain.trim().is_empty() {
            return Err(S9SocketError::InvalidConfiguration("TLS domain cannot be empty".to_string()));
        }
        self.domain = Some(domain);
        Ok(self)
    }
}

// ============================================================================
// Client options
// ============================================================================

/// Configuration options shared by all clients.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) charset: Charset,
    pub(crate) tls: Option<TlsOptions>,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) nodelay: Option<bool>,
    pub(crate) read_buffer_size: usize,
    pub(crate) poll_interval: Duration,
}

impl ClientOptions {
    /// Creates client options for `host:port`.
    /// Host must not be empty, port must be in `1..=65535` and charset must be a known label.
    pub fn new(host: &str, port: u16, charset: &str) -> S9Result<Self> {
        if host.trim().is_empty() {
            return Err(S9SocketError::InvalidConfiguration("Host cannot be empty".to_string()));
        }
        if port == 0 {
            return Err(S9SocketError::InvalidConfiguration("Port must be between 1 and 65535".to_string()));
        }
        Ok(Self {
            host: host.trim().to_string(),
            port,
            charset: Charset::for_label(charset)?,
            tls: None,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            nodelay: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Enables TLS with the given options, or disables it with `None`.
    pub fn tls(mut self, tls: Option<TlsOptions>) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the connect timeout. Must be greater than zero.
    pub fn connect_timeout(mut self, timeout: Duration) -> S9Result<Self> {
        if timeout.is_zero() {
            return Err(S9SocketError::InvalidConfiguration("Connect timeout duration cannot be zero".to_string()));
        }
        self.connect_timeout = timeout;
        Ok(self)
    }

    /// Sets the read (and write) timeout of blocking sockets. Must be greater than zero.
    pub fn read_timeout(mut self, timeout: Duration) -> S9Result<Self> {
        if timeout.is_zero() {
            return Err(S9SocketError::InvalidConfiguration("Read timeout duration cannot be zero".to_string()));
        }
        self.read_timeout = timeout;
        Ok(self)
    }

    /// Enables or disables the `TCP_NODELAY` option for messages to be sent.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = Some(nodelay);
        self
    }

    /// Sets the size of the buffer a single read fills. Must be greater than zero.
    pub fn read_buffer_size(mut self, size: usize) -> S9Result<Self> {
        if size == 0 {
            return Err(S9SocketError::InvalidConfiguration("Read buffer size cannot be zero".to_string()));
        }
        self.read_buffer_size = size;
        Ok(self)
    }

    /// Sets the sleep between empty reads of the callback client. Must be greater than zero.
    pub fn poll_interval(mut self, interval: Duration) -> S9Result<Self> {
        if interval.is_zero() {
            return Err(S9SocketError::InvalidConfiguration("Poll interval cannot be zero".to_string()));
        }
        self.poll_interval = interval;
        Ok(self)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

// ============================================================================
// Server options
// ============================================================================

/// Configuration options shared by all servers.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub(crate) bind_address: IpAddr,
    pub(crate) port: u16,
    pub(crate) charset: Charset,
    pub(crate) worker_threads: usize,
    pub(crate) read_buffer_size: usize,
    pub(crate) nodelay: Option<bool>,
    pub(crate) backlog: i32,
    pub(crate) write_timeout: Duration,
}

impl ServerOptions {
    /// Creates server options listening on `port` of all interfaces.
    /// Port 0 binds an ephemeral port, see `local_addr()` of the servers.
    pub fn new(port: u16, charset: &str) -> S9Result<Self> {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            charset: Charset::for_label(charset)?,
            worker_threads,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            nodelay: None,
            backlog: DEFAULT_BACKLOG,
            write_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the local address to listen on.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Sets the size of the fixed worker pool of the thread-per-connection server.
    /// Every connection occupies one worker for its whole lifetime. Must be greater than zero.
    pub fn worker_threads(mut self, threads: usize) -> S9Result<Self> {
        if threads == 0 {
            return Err(S9SocketError::InvalidConfiguration("Worker threads cannot be zero".to_string()));
        }
        self.worker_threads = threads;
        Ok(self)
    }

    /// Sets the size of the buffer a single read fills. Must be greater than zero.
    pub fn read_buffer_size(mut self, size: usize) -> S9Result<Self> {
        if size == 0 {
            return Err(S9SocketError::InvalidConfiguration("Read buffer size cannot be zero".to_string()));
        }
        self.read_buffer_size = size;
        Ok(self)
    }

    /// Enables or disables the `TCP_NODELAY` option on accepted connections.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = Some(nodelay);
        self
    }

    /// Sets how long a write to an accepted connection may block before that connection is
    /// torn down. Defaults to 15 seconds. Must be greater than zero.
    pub fn write_timeout(mut self, timeout: Duration) -> S9Result<Self> {
        if timeout.is_zero() {
            return Err(S9SocketError::InvalidConfiguration("Write timeout cannot be zero".to_string()));
        }
        self.write_timeout = timeout;
        Ok(self)
    }

    /// Sets the listen backlog of the channel acceptor. Must be greater than zero.
    pub fn backlog(mut self, backlog: i32) -> S9Result<Self> {
        if backlog <= 0 {
            return Err(S9SocketError::InvalidConfiguration("Backlog must be greater than zero".to_string()));
        }
        self.backlog = backlog;
        Ok(self)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_options_reject_bad_arguments() {
        assert!(matches!(ClientOptions::new("", 7000, "UTF-8"), Err(S9SocketError::InvalidConfiguration(_))));
        assert!(matches!(ClientOptions::new("   ", 7000, "UTF-8"), Err(S9SocketError::InvalidConfiguration(_))));
        assert!(matches!(ClientOptions::new("localhost", 0, "UTF-8"), Err(S9SocketError::InvalidConfiguration(_))));
        assert!(matches!(ClientOptions::new("localhost", 7000, ""), Err(S9SocketError::InvalidConfiguration(_))));
        assert!(matches!(ClientOptions::new("localhost", 7000, "klingon"), Err(S9SocketError::InvalidConfiguration(_))));
    }

    #[test]
    fn client_options_defaults() {
        let options = ClientOptions::new("localhost", 65535, "utf8").unwrap();
        assert_eq!(options.host(), "localhost");
        assert_eq!(options.port(), 65535);
        assert_eq!(options.charset().name(), "UTF-8");
        assert_eq!(options.connect_timeout, DEFAULT_TIMEOUT);
        assert_eq!(options.read_timeout, DEFAULT_TIMEOUT);
        assert_eq!(options.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(!options.is_tls());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let options = ClientOptions::new("localhost", 7000, "UTF-8").unwrap();
        assert!(options.clone().connect_timeout(Duration::ZERO).is_err());
        assert!(options.clone().read_timeout(Duration::ZERO).is_err());
        assert!(options.clone().poll_interval(Duration::ZERO).is_err());
        assert!(options.read_buffer_size(0).is_err());
    }

    #[test]
    fn server_options_validation() {
        let options = ServerOptions::new(0, "EUC-KR").unwrap();
        assert_eq!(options.charset().name(), "EUC-KR");
        assert!(options.worker_threads >= 1);
        assert!(options.clone().worker_threads(0).is_err());
        assert!(options.clone().backlog(0).is_err());
        assert_eq!(options.write_timeout, DEFAULT_TIMEOUT);
        assert!(options.clone().write_timeout(Duration::ZERO).is_err());
        assert!(ServerOptions::new(7000, "nope").is_err());
    }

    #[test]
    fn charset_round_trips_korean_text() {
        let charset = Charset::for_label("EUC-KR").unwrap();
        let encoded = charset.encode("안녕");
        assert_ne!(encoded.as_ref(), "안녕".as_bytes());
        assert_eq!(charset.decode(&encoded), "안녕");
    }

    #[test]
    fn tls_domain_cannot_be_empty() {
        assert!(TlsOptions::new().domain("").is_err());
        let tls = TlsOptions::new()
            .trust_store(TrustStore::new("/etc/ssl/ca.pem").with_password("secret"))
            .domain("example.com")
            .unwrap();
        assert_eq!(tls.domain.as_deref(), Some("example.com"));
        assert_eq!(tls.trust_store.unwrap().password.as_deref(), Some("secret"));
    }
}
