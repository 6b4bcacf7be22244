use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use crate::error::{S9Result, S9SocketError};
use super::connection::{Connection, ConnectionId, ConnectionRegistry};
use super::options::ServerOptions;
use super::shared::{self, ReadOutcome};
use super::types::{lock, Lifecycle, Readiness};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_TOKEN: usize = 2;
const EVENTS_CAPACITY: usize = 1024;

// ============================================================================
// ReactorPeer - the part of a reactor connection any thread may touch
// ============================================================================

/// Registry-side state of a reactor connection.
///
/// Other threads and other connections' handlers only store a payload here and request a
/// readiness change; the loop thread alone applies it to the poll registration.
#[derive(Debug)]
pub(crate) struct ReactorPeer {
    token: Token,
    pending_write: Mutex<Option<Vec<u8>>>,
    requested: AtomicU8,
    registered: AtomicU8,
}

impl ReactorPeer {
    fn new(token: Token) -> Self {
        Self {
            token,
            pending_write: Mutex::new(None),
            requested: AtomicU8::new(Readiness::Read.as_u8()),
            registered: AtomicU8::new(Readiness::Read.as_u8()),
        }
    }

    /// Replaces any unsent payload and requests write readiness
    fn queue_write(&self, payload: Vec<u8>) {
        let mut pending = lock!(self.pending_write);
        if pending.is_some() {
            tracing::debug!("Overwriting unsent payload of token {:?}", self.token);
        }
        *pending = Some(payload);
        self.requested.store(Readiness::Write.as_u8(), Ordering::SeqCst);
    }

    fn take_pending(&self) -> Option<Vec<u8>> {
        lock!(self.pending_write).take()
    }

    /// Puts a payload back unless a newer one arrived meanwhile
    fn restore_pending(&self, payload: Vec<u8>) {
        let mut pending = lock!(self.pending_write);
        if pending.is_none() {
            *pending = Some(payload);
        }
    }

    /// Requests read readiness unless another payload is already waiting
    fn finish_write(&self) {
        let pending = lock!(self.pending_write);
        if pending.is_none() {
            self.requested.store(Readiness::Read.as_u8(), Ordering::SeqCst);
        }
    }

    fn requested(&self) -> Readiness {
        Readiness::from_u8(self.requested.load(Ordering::SeqCst))
    }

    /// Readiness the connection is currently registered for
    fn readiness(&self) -> Readiness {
        Readiness::from_u8(self.registered.load(Ordering::SeqCst))
    }
}

/// Snapshot of one reactor connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_address: String,
    pub readiness: Readiness,
}

enum Command {
    Stop,
}

// ============================================================================
// ReactorHandle - cross-thread access to a running reactor
// ============================================================================

/// Cloneable handle for pushing payloads into a running reactor from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    registry: Arc<ConnectionRegistry<ReactorPeer>>,
    waker: Arc<Waker>,
    command_tx: Sender<Command>,
}

impl ReactorHandle {
    /// Queues the payload for every connection whose remote address equals
    /// `remote_address`, overwriting anything still unsent, and wakes the loop.
    /// Returns the number of connections the payload was queued for.
    pub fn send_to(&self, remote_address: &str, payload: &[u8]) -> usize {
        let targets = self.registry.matching(remote_address);
        for target in &targets {
            target.handle().queue_write(payload.to_vec());
        }
        if !targets.is_empty() {
            self.wake();
        }
        targets.len()
    }

    /// Asks the loop to close everything and exit.
    pub fn stop(&self) {
        if self.command_tx.send(Command::Stop).is_err() {
            tracing::trace!("Reactor loop already finished");
            return;
        }
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::warn!("Failed to wake reactor loop: {}", e);
        }
    }
}

// ============================================================================
// S9ReactorServer - Single-threaded readiness-driven server
// ============================================================================

/// Echo server driven by one thread that owns a readiness multiplexer.
///
/// Each connection is registered for either read or write readiness, never both. A received
/// chunk is stored as the pending payload of every connection whose remote address equals
/// the sender's, which flips those connections to write readiness; after one write a
/// connection flips back to read.
///
/// A pending payload is overwritten, not queued, and a partial write drops the remainder.
///
/// ```no_run
/// use s9_socket::{S9ReactorServer, ServerOptions};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut server = S9ReactorServer::new(ServerOptions::new(7000, "UTF-8")?);
/// server.start()?;
/// println!("Listening on {:?}", server.local_addr());
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct S9ReactorServer {
    options: ServerOptions,
    lifecycle: Lifecycle,
    registry: Arc<ConnectionRegistry<ReactorPeer>>,
    handle: Option<ReactorHandle>,
    loop_thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl S9ReactorServer {
    pub fn new(options: ServerOptions) -> S9ReactorServer {
        S9ReactorServer {
            options,
            lifecycle: Lifecycle::Created,
            registry: Arc::new(ConnectionRegistry::new()),
            handle: None,
            loop_thread: None,
            local_addr: None,
        }
    }

    /// Binds the listener and starts the loop thread.
    pub fn start(&mut self) -> S9Result<()> {
        match self.lifecycle {
            Lifecycle::Created => {},
            Lifecycle::Running => return Err(S9SocketError::InvalidState("Server already started".to_string())),
            Lifecycle::Stopped => {
                return Err(S9SocketError::InvalidState("Server stopped and cannot be restarted".to_string()));
            }
        }

        let addr = SocketAddr::new(self.options.bind_address, self.options.port);
        let mut listener = TcpListener::bind(addr).map_err(|e| {
            tracing::error!("Failed to bind {}: {}", addr, e);
            e
        })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (command_tx, command_rx) = unbounded::<Command>();

        let event_loop = EventLoop {
            poll,
            listener,
            waker: Arc::clone(&waker),
            registry: Arc::clone(&self.registry),
            streams: HashMap::new(),
            rearm: HashSet::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            command_rx,
            buf: vec![0u8; self.options.read_buffer_size],
            options: self.options.clone(),
        };
        let loop_thread = Builder::new()
            .name("s9-reactor".to_string())
            .spawn(move || event_loop.run())?;

        tracing::info!("Reactor listening on {}", local_addr);
        self.lifecycle = Lifecycle::Running;
        self.handle = Some(ReactorHandle { registry: Arc::clone(&self.registry), waker, command_tx });
        self.loop_thread = Some(loop_thread);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Closes every connection, the listener and the multiplexer.
    /// Calling it again is harmless.
    pub fn stop(&mut self) {
        let previous = std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped);
        if previous != Lifecycle::Running {
            return;
        }
        if let Some(handle) = &self.handle {
            handle.stop();
        }
        if let Some(loop_thread) = self.loop_thread.take() {
            if loop_thread.join().is_err() {
                tracing::error!("Reactor loop thread panicked");
            }
        }
        tracing::info!("Reactor on {:?} stopped", self.local_addr);
    }

    /// Handle for cross-thread pushes, once started
    pub fn handle(&self) -> Option<ReactorHandle> {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Registered readiness of a connection, `None` once it is gone
    pub fn readiness_of(&self, id: ConnectionId) -> Option<Readiness> {
        self.registry.get(id).map(|c| c.handle().readiness())
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(|c| ConnectionInfo {
                id: c.id(),
                remote_address: c.remote_address().to_string(),
                readiness: c.handle().readiness(),
            })
            .collect()
    }

    pub fn state(&self) -> Lifecycle {
        self.lifecycle
    }
}

impl Drop for S9ReactorServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// EventLoop - owned by the loop thread
// ============================================================================

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    registry: Arc<ConnectionRegistry<ReactorPeer>>,
    streams: HashMap<Token, (TcpStream, Arc<Connection<ReactorPeer>>)>,
    /// Connections whose writable edge was consumed and must be re-registered even when
    /// their interest did not change
    rearm: HashSet<Token>,
    next_token: usize,
    command_rx: Receiver<Command>,
    buf: Vec<u8>,
    options: ServerOptions,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("Reactor poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {},
                    token => {
                        let Some(readiness) = self.registered_readiness(token) else { continue };
                        match readiness {
                            Readiness::Read if event.is_readable() || event.is_read_closed() || event.is_error() => {
                                self.on_readable(token);
                            },
                            Readiness::Write if event.is_writable() || event.is_error() => {
                                self.on_writable(token);
                            },
                            _ => {}
                        }
                    }
                }
            }

            if self.stop_requested() {
                break;
            }
            self.apply_readiness_changes();
        }

        self.close_all();
    }

    fn registered_readiness(&self, token: Token) -> Option<Readiness> {
        self.streams.get(&token).map(|(_, connection)| connection.handle().readiness())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Some(nodelay) = self.options.nodelay {
                        if let Err(e) = stream.set_nodelay(nodelay) {
                            tracing::warn!("Failed to set nodelay for {}: {}", addr, e);
                        }
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        tracing::error!("Failed to register connection from {}: {}", addr, e);
                        continue;
                    }
                    let connection = self.registry.register(shared::remote_address(&addr), ReactorPeer::new(token));
                    tracing::info!("Connection {} established from {}", connection.id(), addr);
                    self.streams.insert(token, (stream, connection));
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }

    fn on_readable(&mut self, token: Token) {
        let Some((stream, connection)) = self.streams.get_mut(&token) else { return };

        match shared::read_chunk(stream, &mut self.buf) {
            Ok(ReadOutcome::Data(n)) => {
                let request = &self.buf[..n];
                let text = self.options.charset.decode(request);
                shared::trace_on_received(n, &text, connection.remote_address());

                let response = shared::echo_response(request);
                for target in self.registry.matching(connection.remote_address()) {
                    target.handle().queue_write(response.to_vec());
                }
                // Interest changes of other connections are applied by the loop after waking
                if let Err(e) = self.waker.wake() {
                    tracing::warn!("Failed to wake reactor loop: {}", e);
                }
            },
            Ok(ReadOutcome::Idle) => {},
            Ok(ReadOutcome::Closed) => {
                tracing::info!("Connection {} closed by peer", connection.id());
                self.teardown(token);
            },
            Err(e) => {
                tracing::error!("Failed to read from connection {}: {}", connection.id(), e);
                self.teardown(token);
            }
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some((stream, connection)) = self.streams.get_mut(&token) else { return };
        let peer = connection.handle();

        if let Some(payload) = peer.take_pending() {
            match stream.write(&payload) {
                Ok(n) => {
                    if n < payload.len() {
                        tracing::warn!("Partial write to connection {}, {} of {} bytes dropped",
                            connection.id(), payload.len() - n, payload.len());
                    }
                    shared::trace_on_sent(&payload[..n], self.options.charset, connection.remote_address());
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    peer.restore_pending(payload);
                    return;
                },
                Err(e) => {
                    tracing::error!("Failed to write to connection {}: {}", connection.id(), e);
                    self.teardown(token);
                    return;
                }
            }
        }

        // A payload queued meanwhile keeps the connection on write, which needs a fresh edge
        peer.finish_write();
        self.rearm.insert(token);
    }

    /// Re-registers every connection whose requested readiness differs from its registration,
    /// and every connection that finished a write
    fn apply_readiness_changes(&mut self) {
        let rearm = std::mem::take(&mut self.rearm);
        let mut failed = Vec::new();
        for (token, (stream, connection)) in self.streams.iter_mut() {
            let peer = connection.handle();
            let requested = peer.requested();
            if requested == peer.readiness() && !rearm.contains(token) {
                continue;
            }
            match self.poll.registry().reregister(stream, *token, requested.interest()) {
                Ok(()) => peer.registered.store(requested.as_u8(), Ordering::SeqCst),
                Err(e) => {
                    tracing::error!("Failed to re-register connection {}: {}", connection.id(), e);
                    failed.push(*token);
                }
            }
        }
        for token in failed {
            self.teardown(token);
        }
    }

    fn stop_requested(&self) -> bool {
        self.command_rx.try_iter().any(|command| matches!(command, Command::Stop))
    }

    fn teardown(&mut self, token: Token) {
        let Some((mut stream, connection)) = self.streams.remove(&token) else { return };
        if let Err(e) = self.poll.registry().deregister(&mut stream) {
            tracing::trace!("Failed to deregister connection {}: {}", connection.id(), e);
        }
        self.registry.remove(connection.id());
        tracing::info!("Connection {} from {} closed", connection.id(), connection.remote_address());
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.streams.keys().copied().collect();
        for token in tokens {
            self.teardown(token);
        }
        self.registry.drain();
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            tracing::trace!("Failed to deregister listener: {}", e);
        }
        tracing::debug!("Reactor loop finished");
    }
}
