use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Builder};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crate::error::{S9Result, S9SocketError};
use super::options::ClientOptions;
use super::shared::{self, MaybeTlsStream, ReadOutcome};
use super::types::{lock, Lifecycle, S9ClientListener};

macro_rules! emit {
    ($sender:expr, $context:expr, $event:expr) => {
        if let Err(e) = $sender.send($event) {
            tracing::error!("Failed to send context {} through channel: {}", $context, e);
        }
    };
}

/// Events handed from the socket threads to the dispatch thread that owns the listener
#[derive(Debug)]
enum ClientEvent {
    Connected(String),
    Data(String),
    Disconnected,
    Error(String),
    Quit,
}

type SharedListener = Arc<Mutex<Option<Box<dyn S9ClientListener>>>>;

// ============================================================================
// S9AsyncCallbackClient - Background receive loop with listener callbacks
// ============================================================================

/// Client with a background receive loop that reports through an [`S9ClientListener`].
///
/// `start_client()` connects on a background thread (with a blocking TLS handshake if
/// enabled), then polls the non-blocking socket on a dedicated receive thread, sleeping for
/// the poll interval (100 ms by default) whenever nothing is available.
///
/// Listener callbacks run on a separate dispatch thread, in the order events occurred.
/// The client is one-shot: once stopped it cannot be started again.
///
/// ```no_run
/// use s9_socket::{ClientOptions, S9AsyncCallbackClient, S9ClientListener};
///
/// struct Printer;
///
/// impl S9ClientListener for Printer {
///     fn on_data_received(&mut self, data: &str) { println!("Received: {}", data); }
///     fn on_disconnected(&mut self) { println!("Disconnected"); }
///     fn on_error(&mut self, error: String) { eprintln!("Error: {}", error); }
/// }
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = S9AsyncCallbackClient::new(ClientOptions::new("localhost", 7000, "UTF-8")?);
/// client.set_listener(Printer);
/// client.start_client()?;
/// # Ok(())
/// # }
/// ```
pub struct S9AsyncCallbackClient {
    inner: Arc<Inner>,
    listener: SharedListener,
    event_rx: Receiver<ClientEvent>,
}

struct Inner {
    options: ClientOptions,
    lifecycle: Mutex<Lifecycle>,
    connected: AtomicBool,
    stream: Mutex<Option<MaybeTlsStream>>,
    socket: Mutex<Option<TcpStream>>,
    event_tx: Sender<ClientEvent>,
}

impl S9AsyncCallbackClient {
    pub fn new(options: ClientOptions) -> S9AsyncCallbackClient {
        let (event_tx, event_rx) = unbounded::<ClientEvent>();
        S9AsyncCallbackClient {
            inner: Arc::new(Inner {
                options,
                lifecycle: Mutex::new(Lifecycle::Created),
                connected: AtomicBool::new(false),
                stream: Mutex::new(None),
                socket: Mutex::new(None),
                event_tx,
            }),
            listener: Arc::new(Mutex::new(None)),
            event_rx,
        }
    }

    /// Installs the listener, replacing any previous one.
    ///
    /// Must not be called from inside a listener callback.
    pub fn set_listener<L>(&self, listener: L)
    where
        L: S9ClientListener + 'static,
    {
        *lock!(self.listener) = Some(Box::new(listener));
    }

    /// Starts the dispatch and connect threads and returns immediately.
    ///
    /// Connect and handshake failures are reported through `on_error`.
    pub fn start_client(&self) -> S9Result<()> {
        {
            let mut lifecycle = lock!(self.inner.lifecycle);
            match *lifecycle {
                Lifecycle::Created => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => {
                    return Err(S9SocketError::InvalidState("Client already started".to_string()));
                },
                Lifecycle::Stopped => {
                    return Err(S9SocketError::InvalidState("Client stopped and cannot be restarted".to_string()));
                }
            }
        }

        let event_rx = self.event_rx.clone();
        let listener = Arc::clone(&self.listener);
        Builder::new()
            .name("s9-callback-dispatch".to_string())
            .spawn(move || dispatch_events(event_rx, listener))?;

        let inner = Arc::clone(&self.inner);
        Builder::new()
            .name("s9-callback-connect".to_string())
            .spawn(move || inner.connect())?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Started client for {}", self.inner.peer());
        }
        Ok(())
    }

    /// Writes the payload on the calling thread.
    ///
    /// Before the connection is established the payload is dropped with a warning.
    /// A failed write stops the client and is reported through `on_error`.
    pub fn send(&self, payload: &[u8]) {
        self.inner.send(payload);
    }

    /// Closes the connection and reports `on_disconnected`. Calling it again is harmless.
    pub fn stop_client(&self) {
        self.inner.stop(None);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Lifecycle {
        *lock!(self.inner.lifecycle)
    }
}

impl Drop for S9AsyncCallbackClient {
    fn drop(&mut self) {
        self.inner.stop(None);
    }
}

fn dispatch_events(event_rx: Receiver<ClientEvent>, listener: SharedListener) {
    while let Ok(event) = event_rx.recv() {
        if let ClientEvent::Quit = event {
            break;
        }

        let mut listener = lock!(listener);
        let Some(listener) = listener.as_mut() else {
            tracing::trace!("No listener installed, dropping event {:?}", event);
            continue;
        };
        match event {
            ClientEvent::Connected(remote_address) => listener.on_connected(&remote_address),
            ClientEvent::Data(text) => listener.on_data_received(&text),
            ClientEvent::Disconnected => listener.on_disconnected(),
            ClientEvent::Error(error) => listener.on_error(error),
            ClientEvent::Quit => break,
        }
    }
    tracing::trace!("Dispatch thread finished");
}

impl Inner {
    fn peer(&self) -> String {
        format!("{}:{}", self.options.host, self.options.port)
    }

    fn connect(self: Arc<Self>) {
        let stream = match shared::connect_stream(&self.options) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", self.peer(), e);
                self.stop(Some(format!("Failed to connect to {}: {}", self.peer(), e)));
                return;
            }
        };

        let installed = stream.get_ref().set_nonblocking(true)
            .and_then(|_| stream.get_ref().try_clone())
            .and_then(|socket| socket.peer_addr().map(|addr| (socket, addr)));
        let (socket, peer_addr) = match installed {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to configure connection to {}: {}", self.peer(), e);
                self.stop(Some(format!("Failed to configure connection: {}", e)));
                return;
            }
        };
        let tls = stream.is_tls();

        {
            let lifecycle = lock!(self.lifecycle);
            if *lifecycle != Lifecycle::Running {
                shared::shutdown_with_logging(&socket, "on stopped during connect");
                return;
            }
            *lock!(self.stream) = Some(stream);
            *lock!(self.socket) = Some(socket);
            self.connected.store(true, Ordering::SeqCst);
        }

        shared::trace_on_connected(&peer_addr, tls);
        emit!(self.event_tx, "ClientEvent::Connected", ClientEvent::Connected(shared::remote_address(&peer_addr)));

        let inner = Arc::clone(&self);
        let spawned = Builder::new()
            .name("s9-callback-receive".to_string())
            .spawn(move || inner.receive_loop());
        if let Err(e) = spawned {
            tracing::error!("Failed to start receive thread: {}", e);
            self.stop(Some(format!("Failed to start receive thread: {}", e)));
        }
    }

    fn receive_loop(&self) {
        let peer = self.peer();
        let mut buf = vec![0u8; self.options.read_buffer_size];

        while self.connected.load(Ordering::SeqCst) {
            let outcome = {
                let mut stream = lock!(self.stream);
                match stream.as_mut() {
                    Some(stream) => shared::read_chunk(stream, &mut buf),
                    None => break,
                }
            };

            match outcome {
                Ok(ReadOutcome::Data(n)) => {
                    let text = self.options.charset.decode(&buf[..n]).into_owned();
                    shared::trace_on_received(n, &text, &peer);
                    emit!(self.event_tx, "ClientEvent::Data", ClientEvent::Data(text));
                },
                Ok(ReadOutcome::Idle) => thread::sleep(self.options.poll_interval),
                Ok(ReadOutcome::Closed) => {
                    tracing::info!("Connection to {} closed by peer", peer);
                    self.stop(Some(S9SocketError::ConnectionClosed.to_string()));
                },
                Err(e) => {
                    if self.connected.load(Ordering::SeqCst) {
                        tracing::error!("Failed to read from {}: {}", peer, e);
                        self.stop(Some(format!("Failed to read from {}: {}", peer, e)));
                    }
                }
            }
        }
        tracing::trace!("Receive loop for {} finished", peer);
    }

    fn send(&self, payload: &[u8]) {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::warn!("Not connected yet, dropping {} bytes", payload.len());
            return;
        }

        let result = {
            let mut stream = lock!(self.stream);
            match stream.as_mut() {
                Some(stream) => shared::write_payload_non_blocking(stream, payload),
                None => {
                    tracing::warn!("Connection already closed, dropping {} bytes", payload.len());
                    return;
                }
            }
        };

        match result {
            Ok(()) => shared::trace_on_sent(payload, self.options.charset, &self.peer()),
            Err(e) => {
                tracing::error!("Failed to send to {}: {}", self.peer(), e);
                self.stop(Some(format!("Failed to send to {}: {}", self.peer(), e)));
            }
        }
    }

    /// Closes and releases the connection, then reports `on_disconnected` and the error if any.
    /// Only the first call has an effect.
    fn stop(&self, error: Option<String>) {
        let previous = std::mem::replace(&mut *lock!(self.lifecycle), Lifecycle::Stopped);
        if previous == Lifecycle::Stopped {
            return;
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        if let Some(socket) = lock!(self.socket).take() {
            shared::shutdown_with_logging(&socket, "on stop");
        }
        if let Some(mut stream) = lock!(self.stream).take() {
            stream.shutdown();
        }

        if was_connected {
            tracing::info!("Connection to {} closed", self.peer());
            emit!(self.event_tx, "ClientEvent::Disconnected", ClientEvent::Disconnected);
        }
        if let Some(error) = error {
            emit!(self.event_tx, "ClientEvent::Error", ClientEvent::Error(error));
        }
        emit!(self.event_tx, "ClientEvent::Quit", ClientEvent::Quit);
    }
}
