use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use crate::error::{S9Result, S9SocketError};
use super::connection::{Connection, ConnectionRegistry};
use super::options::ServerOptions;
use super::shared::{self, ReadOutcome};
use super::types::{lock, AcceptorKind, Lifecycle};
use super::worker_pool::WorkerPool;

/// How long stop() waits for its wake-up connection to the listener
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Acceptor - the listening socket in blocking mode
// ============================================================================

enum Acceptor {
    Stream(TcpListener),
    Channel(Socket),
}

impl Acceptor {
    fn bind(options: &ServerOptions, kind: AcceptorKind) -> io::Result<Self> {
        let addr = SocketAddr::new(options.bind_address, options.port);
        match kind {
            AcceptorKind::Stream => Ok(Acceptor::Stream(TcpListener::bind(addr)?)),
            AcceptorKind::Channel => {
                let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
                socket.set_reuse_address(true)?;
                socket.bind(&SockAddr::from(addr))?;
                socket.listen(options.backlog)?;
                Ok(Acceptor::Channel(socket))
            }
        }
    }

    fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match self {
            Acceptor::Stream(listener) => listener.accept(),
            Acceptor::Channel(socket) => {
                let (socket, addr) = socket.accept()?;
                let addr = addr.as_socket().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "Accepted a non-IP connection")
                })?;
                Ok((TcpStream::from(socket), addr))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Acceptor::Stream(listener) => listener.local_addr(),
            Acceptor::Channel(socket) => socket.local_addr()?.as_socket().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "Listener bound to a non-IP address")
            }),
        }
    }

    /// Interrupts a pending accept where the platform allows it
    fn interrupt(&self) {
        if let Acceptor::Channel(socket) = self {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                tracing::trace!("Listener shutdown not supported: {}", e);
            }
        }
    }
}

// ============================================================================
// StreamHandle - write side of an accepted connection
// ============================================================================

/// Transport handle of a thread-per-connection server connection.
///
/// The read side is owned by the connection's read task; routing from other tasks goes
/// through the write side.
#[derive(Debug)]
pub(crate) struct StreamHandle {
    writer: Mutex<TcpStream>,
    socket: TcpStream,
}

impl StreamHandle {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        shared::write_payload(&mut *lock!(self.writer), payload)
    }

    fn close(&self) {
        shared::shutdown_with_logging(&self.socket, "on connection close");
    }
}

// ============================================================================
// S9BlockingServer - Thread-per-connection server
// ============================================================================

/// Echo server with one accept thread and one long-lived read task per connection on a
/// fixed worker pool.
///
/// Every received chunk is echoed to every registered connection whose remote address
/// (peer IP) equals the sender's, the sender included. Two clients on one host therefore
/// both receive what either of them sends.
///
/// Each connection occupies a worker for its lifetime, so at most
/// [`worker_threads`](ServerOptions::worker_threads) connections are served concurrently.
///
/// ```no_run
/// use s9_socket::{AcceptorKind, S9BlockingServer, ServerOptions};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = S9BlockingServer::new(ServerOptions::new(7000, "UTF-8")?, AcceptorKind::Stream);
/// server.start()?;
/// // ...
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct S9BlockingServer {
    kind: AcceptorKind,
    lifecycle: Lifecycle,
    shared: Arc<ServerShared>,
    acceptor: Option<Arc<Acceptor>>,
    pool: Option<Arc<WorkerPool>>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

struct ServerShared {
    options: ServerOptions,
    registry: ConnectionRegistry<StreamHandle>,
    running: AtomicBool,
}

impl S9BlockingServer {
    pub fn new(options: ServerOptions, kind: AcceptorKind) -> S9BlockingServer {
        S9BlockingServer {
            kind,
            lifecycle: Lifecycle::Created,
            shared: Arc::new(ServerShared::new(options)),
            acceptor: None,
            pool: None,
            accept_thread: None,
            local_addr: None,
        }
    }

    /// Binds the listener and starts the accept thread.
    pub fn start(&mut self) -> S9Result<()> {
        match self.lifecycle {
            Lifecycle::Created => {},
            Lifecycle::Running => return Err(S9SocketError::InvalidState("Server already started".to_string())),
            Lifecycle::Stopped => {
                return Err(S9SocketError::InvalidState("Server stopped and cannot be restarted".to_string()));
            }
        }

        let acceptor = Arc::new(Acceptor::bind(&self.shared.options, self.kind).map_err(|e| {
            tracing::error!("Failed to bind port {}: {}", self.shared.options.port, e);
            e
        })?);
        let local_addr = acceptor.local_addr()?;
        let pool = Arc::new(WorkerPool::fixed("s9-blocking-server", self.shared.options.worker_threads)?);

        self.shared.running.store(true, Ordering::SeqCst);
        let accept_thread = {
            let shared = Arc::clone(&self.shared);
            let acceptor = Arc::clone(&acceptor);
            let pool = Arc::clone(&pool);
            Builder::new()
                .name("s9-blocking-accept".to_string())
                .spawn(move || shared.accept_loop(&acceptor, &pool))
        };
        let accept_thread = match accept_thread {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                pool.shutdown_now();
                return Err(e.into());
            }
        };

        tracing::info!("Server listening on {} ({:?} acceptor)", local_addr, self.kind);
        self.lifecycle = Lifecycle::Running;
        self.acceptor = Some(acceptor);
        self.pool = Some(pool);
        self.accept_thread = Some(accept_thread);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Closes every connection and the listener, and cancels queued tasks.
    /// Calling it again is harmless.
    pub fn stop(&mut self) {
        let previous = std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped);
        if previous != Lifecycle::Running {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);

        for connection in self.shared.registry.drain() {
            connection.handle().close();
        }

        let mut accept_woken = true;
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.interrupt();
            if let Some(addr) = self.local_addr {
                accept_woken = wake_accept(addr);
            }
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown_now();
        }
        if let Some(handle) = self.accept_thread.take() {
            if accept_woken {
                if handle.join().is_err() {
                    tracing::error!("Accept thread panicked");
                }
            } else {
                tracing::warn!("Could not wake the accept thread, leaving it detached");
            }
        }
        tracing::info!("Server on {:?} stopped", self.local_addr);
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn remote_addresses(&self) -> Vec<String> {
        self.shared.registry.remote_addresses()
    }

    pub fn state(&self) -> Lifecycle {
        self.lifecycle
    }
}

impl Drop for S9BlockingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Unblocks a pending accept by connecting to the listener
fn wake_accept(addr: SocketAddr) -> bool {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    };
    match TcpStream::connect_timeout(&target, WAKE_CONNECT_TIMEOUT) {
        Ok(_) => true,
        // Refused means the listener is already gone, so is the accept
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => true,
        Err(e) => {
            tracing::warn!("Failed to wake accept thread on {}: {}", target, e);
            false
        }
    }
}

impl ServerShared {
    fn new(options: ServerOptions) -> Self {
        Self {
            options,
            registry: ConnectionRegistry::new(),
            running: AtomicBool::new(false),
        }
    }

    fn accept_loop(self: Arc<Self>, acceptor: &Acceptor, pool: &Arc<WorkerPool>) {
        while self.running.load(Ordering::SeqCst) {
            match acceptor.accept() {
                Ok((stream, addr)) => {
                    if !self.running.load(Ordering::SeqCst) {
                        shared::shutdown_with_logging(&stream, "on accept during stop");
                        break;
                    }
                    if let Err(e) = Arc::clone(&self).register(stream, addr, pool) {
                        tracing::error!("Failed to register connection from {}: {}", addr, e);
                    }
                },
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
        tracing::debug!("Accept loop finished");
    }

    fn register(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, pool: &WorkerPool) -> S9Result<()> {
        if let Some(nodelay) = self.options.nodelay {
            stream.set_nodelay(nodelay)?;
        }
        // Bounds how long routing can block on a peer that stopped reading
        stream.set_write_timeout(Some(self.options.write_timeout))?;
        let reader = stream.try_clone()?;
        let socket = stream.try_clone()?;
        let handle = StreamHandle { writer: Mutex::new(stream), socket };

        let connection = self.registry.register(shared::remote_address(&addr), handle);
        // stop() may have drained the registry between the accept and the register above
        if !self.running.load(Ordering::SeqCst) {
            self.teardown(&connection);
            return Ok(());
        }
        tracing::info!("Connection {} established from {}", connection.id(), addr);

        let task_connection = Arc::clone(&connection);
        let shared = Arc::clone(&self);
        if let Err(e) = pool.submit(move || shared.serve(task_connection, reader)) {
            self.teardown(&connection);
            return Err(e);
        }
        Ok(())
    }

    /// Read task of one connection, runs until the stream ends or fails
    fn serve(&self, connection: Arc<Connection<StreamHandle>>, mut reader: TcpStream) {
        let mut buf = vec![0u8; self.options.read_buffer_size];

        loop {
            match shared::read_chunk(&mut reader, &mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    let request = &buf[..n];
                    let text = self.options.charset.decode(request);
                    shared::trace_on_received(n, &text, connection.remote_address());
                    self.route(&connection, shared::echo_response(request));
                },
                Ok(ReadOutcome::Idle) => continue,
                Ok(ReadOutcome::Closed) => {
                    tracing::info!("Connection {} closed by peer", connection.id());
                    break;
                },
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) && self.registry.contains(connection.id()) {
                        tracing::error!("Failed to read from connection {}: {}", connection.id(), e);
                    }
                    break;
                }
            }
        }

        self.teardown(&connection);
    }

    /// Sends the response to every connection sharing the sender's remote address
    fn route(&self, sender: &Connection<StreamHandle>, response: &[u8]) {
        for target in self.registry.matching(sender.remote_address()) {
            match target.handle().send(response) {
                Ok(()) => shared::trace_on_sent(response, self.options.charset, target.remote_address()),
                Err(e) => {
                    tracing::warn!("Failed to send to connection {}: {}", target.id(), e);
                    self.teardown(&target);
                }
            }
        }
    }

    fn teardown(&self, connection: &Connection<StreamHandle>) {
        if self.registry.remove(connection.id()).is_some() {
            tracing::info!("Connection {} from {} closed", connection.id(), connection.remote_address());
        }
        connection.handle().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        (client, accepted, addr)
    }

    #[test]
    fn register_after_stop_closes_the_late_connection() {
        let shared = Arc::new(ServerShared::new(ServerOptions::new(0, "UTF-8").unwrap()));
        let pool = WorkerPool::fixed("test-late-register", 1).unwrap();
        let (mut client, accepted, addr) = connected_pair();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        Arc::clone(&shared).register(accepted, addr, &pool).unwrap();

        assert_eq!(shared.registry.len(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        pool.shutdown_now();
    }

    #[test]
    fn register_while_running_serves_the_connection() {
        let shared = Arc::new(ServerShared::new(ServerOptions::new(0, "UTF-8").unwrap()));
        shared.running.store(true, Ordering::SeqCst);
        let pool = WorkerPool::fixed("test-register", 1).unwrap();
        let (mut client, accepted, addr) = connected_pair();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        Arc::clone(&shared).register(accepted, addr, &pool).unwrap();
        assert_eq!(shared.registry.remote_addresses(), vec!["127.0.0.1".to_string()]);

        std::io::Write::write_all(&mut client, b"echo").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"echo");

        shared.running.store(false, Ordering::SeqCst);
        for connection in shared.registry.drain() {
            connection.handle().close();
        }
        pool.shutdown_now();
    }
}
