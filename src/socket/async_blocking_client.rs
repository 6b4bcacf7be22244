use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use native_tls::TlsStream;
use crate::error::{S9Result, S9SocketError};
use super::options::ClientOptions;
use super::shared::{self, MaybeTlsStream, ReadOutcome};
use super::types::{lock, submit_or_log, Lifecycle};
use super::worker_pool::WorkerPool;

/// Socket read timeout of a TLS connection; reads retry in slices of this length so that
/// writes can take the shared TLS session in between
const TLS_READ_SLICE: Duration = Duration::from_millis(50);

// ============================================================================
// S9AsyncBlockingClient - Blocking sockets driven from a cached worker pool
// ============================================================================

/// Client whose connect and send run as tasks on its own cached worker pool, while
/// `receive()` blocks the calling thread.
///
/// The client is one-shot: `stop()` shuts the pool down and a stopped client cannot be
/// started again.
///
/// ```no_run
/// use s9_socket::{ClientOptions, S9AsyncBlockingClient};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = S9AsyncBlockingClient::new(ClientOptions::new("localhost", 7000, "UTF-8")?);
/// client.start()?;
/// client.send(b"ping");
/// println!("Received: {:?}", client.receive());
/// client.stop();
/// # Ok(())
/// # }
/// ```
pub struct S9AsyncBlockingClient {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    lifecycle: Mutex<Lifecycle>,
    connected: AtomicBool,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    socket: Mutex<Option<TcpStream>>,
    pool: WorkerPool,
}

impl S9AsyncBlockingClient {
    pub fn new(options: ClientOptions) -> S9AsyncBlockingClient {
        S9AsyncBlockingClient {
            inner: Arc::new(Inner {
                options,
                lifecycle: Mutex::new(Lifecycle::Created),
                connected: AtomicBool::new(false),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
                socket: Mutex::new(None),
                pool: WorkerPool::cached("s9-async-client"),
            }),
        }
    }

    /// Submits the connect task and returns immediately.
    ///
    /// Connect failures are logged only; `is_connected()` stays false.
    pub fn start(&self) -> S9Result<()> {
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

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Starting connect to {}:{}", self.inner.options.host, self.inner.options.port);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.pool.submit(move || inner.connect())
    }

    /// Queues a fire-and-forget write.
    ///
    /// Before the connection is established the payload is dropped with a warning.
    /// A failed write stops the client.
    pub fn send(&self, payload: &[u8]) {
        if !self.is_connected() {
            tracing::warn!("Not connected yet, dropping {} bytes", payload.len());
            return;
        }

        let inner = Arc::clone(&self.inner);
        let payload = payload.to_vec();
        submit_or_log!(self.inner.pool, "send", move || inner.write(&payload));
    }

    /// Performs one blocking read on the calling thread.
    ///
    /// Returns `None` when not connected, when nothing arrived before the read timeout,
    /// or when the connection ended (which also stops the client).
    pub fn receive(&self) -> Option<String> {
        if !self.is_connected() {
            return None;
        }

        let mut buf = vec![0u8; self.inner.options.read_buffer_size];
        let outcome = {
            let mut reader = lock!(self.inner.reader);
            let reader = reader.as_mut()?;
            shared::read_chunk(reader, &mut buf)
        };

        let peer = self.inner.peer();
        match outcome {
            Ok(ReadOutcome::Data(n)) => {
                let text = self.inner.options.charset.decode(&buf[..n]).into_owned();
                shared::trace_on_received(n, &text, &peer);
                Some(text)
            },
            Ok(ReadOutcome::Idle) => None,
            Ok(ReadOutcome::Closed) => {
                tracing::info!("Connection to {} closed by peer", peer);
                self.inner.stop();
                None
            },
            Err(e) => {
                if self.is_connected() {
                    tracing::error!("Failed to read from {}: {}", peer, e);
                    self.inner.stop();
                }
                None
            }
        }
    }

    /// Closes the connection and shuts the worker pool down. Calling it again is harmless.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Lifecycle {
        *lock!(self.inner.lifecycle)
    }
}

impl Drop for S9AsyncBlockingClient {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Inner {
    fn peer(&self) -> String {
        format!("{}:{}", self.options.host, self.options.port)
    }

    fn connect(&self) {
        let stream = match shared::connect_stream(&self.options) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", self.peer(), e);
                return;
            }
        };

        match self.install(stream) {
            Ok(true) => {},
            Ok(false) => tracing::debug!("Client stopped while connecting, connection discarded"),
            Err(e) => tracing::error!("Failed to set up connection to {}: {}", self.peer(), e),
        }
    }

    /// Splits the stream into reader and writer halves and publishes them.
    /// Returns false if the client was stopped in the meantime.
    fn install(&self, stream: MaybeTlsStream) -> io::Result<bool> {
        let socket = stream.get_ref().try_clone()?;
        let peer_addr = socket.peer_addr()?;
        let tls = stream.is_tls();

        let (reader, writer): (Box<dyn Read + Send>, Box<dyn Write + Send>) = match stream {
            MaybeTlsStream::Plain(stream) => (Box::new(stream.try_clone()?), Box::new(stream)),
            MaybeTlsStream::NativeTls(stream) => {
                stream.get_ref().set_read_timeout(Some(TLS_READ_SLICE))?;
                let shared = SharedTls {
                    stream: Arc::new(Mutex::new(stream)),
                    read_timeout: self.options.read_timeout,
                };
                (Box::new(shared.clone()), Box::new(shared))
            }
        };

        // Hold the lifecycle lock so a concurrent stop() either sees the socket or wins first
        let lifecycle = lock!(self.lifecycle);
        if *lifecycle != Lifecycle::Running {
            shared::shutdown_with_logging(&socket, "on stopped during connect");
            return Ok(false);
        }
        *lock!(self.reader) = Some(reader);
        *lock!(self.writer) = Some(writer);
        *lock!(self.socket) = Some(socket);
        self.connected.store(true, Ordering::SeqCst);
        drop(lifecycle);

        shared::trace_on_connected(&peer_addr, tls);
        Ok(true)
    }

    fn write(&self, payload: &[u8]) {
        let result = {
            let mut writer = lock!(self.writer);
            match writer.as_mut() {
                Some(writer) => shared::write_payload(writer, payload),
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
                self.stop();
            }
        }
    }

    fn stop(&self) {
        let previous = std::mem::replace(&mut *lock!(self.lifecycle), Lifecycle::Stopped);
        self.connected.store(false, Ordering::SeqCst);

        // Shutting the socket down unblocks a receive() in progress
        if let Some(socket) = lock!(self.socket).take() {
            shared::shutdown_with_logging(&socket, "on stop");
            tracing::info!("Connection to {} closed", self.peer());
        }
        lock!(self.writer).take();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        self.pool.shutdown_now();

        if previous != Lifecycle::Stopped && tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!("Client for {} stopped", self.peer());
        }
    }
}

/// One TLS session shared by the reader and writer halves
#[derive(Clone)]
struct SharedTls {
    stream: Arc<Mutex<TlsStream<TcpStream>>>,
    read_timeout: Duration,
}

impl Read for SharedTls {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let result = lock!(self.stream).read(buf);
            match result {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
                    && Instant::now() < deadline => continue,
                result => return result,
            }
        }
    }
}

impl Write for SharedTls {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock!(self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock!(self.stream).flush()
    }
}
