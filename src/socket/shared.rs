use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use native_tls::{Certificate, Identity, TlsConnector, TlsStream};
use crate::error::{S9Result, S9SocketError};
use super::options::{Charset, ClientOptions, TlsOptions};

// ============================================================================
// Shared Internal Helpers
// ============================================================================

/// Sleep between retries of a write that hit `WouldBlock` on a non-blocking socket
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A client transport, plain or wrapped in TLS
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    NativeTls(TlsStream<TcpStream>),
}

impl MaybeTlsStream {
    pub(crate) fn get_ref(&self) -> &TcpStream {
        match self {
            MaybeTlsStream::Plain(stream) => stream,
            MaybeTlsStream::NativeTls(stream) => stream.get_ref(),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::NativeTls(_))
    }

    /// Sends a TLS close_notify where applicable, then closes both directions of the socket
    pub(crate) fn shutdown(&mut self) {
        if let MaybeTlsStream::NativeTls(stream) = self {
            if let Err(e) = stream.shutdown() {
                tracing::trace!("TLS close_notify not sent: {}", e);
            }
        }
        shutdown_with_logging(self.get_ref(), "on shutdown");
    }
}

impl Read for MaybeTlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.read(buf),
            MaybeTlsStream::NativeTls(stream) => stream.read(buf),
        }
    }
}

impl Write for MaybeTlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.write(buf),
            MaybeTlsStream::NativeTls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.flush(),
            MaybeTlsStream::NativeTls(stream) => stream.flush(),
        }
    }
}

/// Result of one bounded read
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// `n` bytes were read into the buffer
    Data(usize),
    /// The peer closed the stream
    Closed,
    /// Nothing available right now (non-blocking) or the read timed out
    Idle,
}

/// Performs exactly one read and classifies the result
pub(crate) fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    match reader.read(buf) {
        Ok(0) => Ok(ReadOutcome::Closed),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Idle),
        // No data available (e.g. Windows reports read timeouts as TimedOut)
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(ReadOutcome::Idle),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::Idle),
        Err(e) => Err(e),
    }
}

/// Writes the whole payload and flushes
pub(crate) fn write_payload<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload)?;
    writer.flush()
}

/// Writes the whole payload to a non-blocking socket, waiting out `WouldBlock`
pub(crate) fn write_payload_non_blocking<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < payload.len() {
        match writer.write(&payload[written..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "Failed to write to socket")),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(WRITE_RETRY_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(WRITE_RETRY_INTERVAL),
            Err(e) => return Err(e),
        }
    }
}

/// Response payload for a request: the request itself, untransformed
#[inline]
pub(crate) fn echo_response(request: &[u8]) -> &[u8] {
    request
}

/// The identity string a connection is routed by: the peer IP, without the port
pub(crate) fn remote_address(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

/// Resolves `host:port` to the first socket address
pub(crate) fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("No address found for {}:{}", host, port)))
}

/// Opens a blocking connection with the configured timeouts, negotiating TLS if enabled
pub(crate) fn connect_stream(options: &ClientOptions) -> S9Result<MaybeTlsStream> {
    // Unreadable trust material fails before any connection is opened
    let connector = match &options.tls {
        Some(tls) => Some(build_tls_connector(tls)?),
        None => None,
    };

    let addr = resolve(&options.host, options.port)?;
    let stream = TcpStream::connect_timeout(&addr, options.connect_timeout)?;
    configure_blocking(&stream, options)?;

    match (&options.tls, connector) {
        (Some(tls), Some(connector)) => {
            let domain = tls.domain.as_deref().unwrap_or(&options.host);
            let stream = connector.connect(domain, stream)?;
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!("TLS handshake with {} completed", addr);
            }
            Ok(MaybeTlsStream::NativeTls(stream))
        },
        _ => Ok(MaybeTlsStream::Plain(stream)),
    }
}

/// Configures socket for blocking operation
pub(crate) fn configure_blocking(stream: &TcpStream, options: &ClientOptions) -> S9Result<()> {
    stream.set_read_timeout(Some(options.read_timeout))?;
    stream.set_write_timeout(Some(options.read_timeout))?;
    if let Some(nodelay) = options.nodelay {
        stream.set_nodelay(nodelay)?;
    }
    Ok(())
}

/// Builds a TLS connector on the platform trust store plus the optional configured one
pub(crate) fn build_tls_connector(tls: &TlsOptions) -> S9Result<TlsConnector> {
    let mut builder = TlsConnector::builder();

    if let Some(trust_store) = &tls.trust_store {
        let bytes = fs::read(&trust_store.path).map_err(|e| {
            tracing::error!("Failed to read trust store {}: {}", trust_store.path.display(), e);
            e
        })?;
        match &trust_store.password {
            Some(password) => {
                builder.identity(Identity::from_pkcs12(&bytes, password)?);
            },
            None => {
                for certificate in parse_certificates(&bytes)? {
                    builder.add_root_certificate(certificate);
                }
            }
        }
    }

    Ok(builder.build()?)
}

/// Reads a PEM bundle, or a single DER certificate when no PEM marker is present
fn parse_certificates(bytes: &[u8]) -> S9Result<Vec<Certificate>> {
    const END_MARKER: &str = "-----END CERTIFICATE-----";

    let text = match std::str::from_utf8(bytes) {
        Ok(text) if text.contains("-----BEGIN CERTIFICATE-----") => text,
        _ => return Ok(vec![Certificate::from_der(bytes)?]),
    };

    let mut certificates = Vec::new();
    for block in text.split_inclusive(END_MARKER) {
        if block.contains(END_MARKER) {
            certificates.push(Certificate::from_pem(block.trim().as_bytes())?);
        }
    }
    Ok(certificates)
}

/// Closes both directions of a socket; a socket that is already disconnected is not an error
pub(crate) fn shutdown_with_logging(stream: &TcpStream, context: &str) {
    match stream.shutdown(Shutdown::Both) {
        Ok(()) => tracing::trace!("Socket shut down for context: {}", context),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {},
        Err(e) => tracing::warn!("Error shutting down socket for context {}: {}", context, e),
    }
}

/// Traces connection establishment
pub(crate) fn trace_on_connected(peer: &SocketAddr, tls: bool) {
    tracing::info!("Connected to {} (tls: {})", peer, tls);
}

/// Traces an outbound payload, decoded with the given charset for display
#[inline]
pub(crate) fn trace_on_sent(payload: &[u8], charset: Charset, peer: &str) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!("Sent {} bytes to {}: {}", payload.len(), peer, charset.decode(payload));
    }
}

/// Traces an inbound payload that has already been decoded
#[inline]
pub(crate) fn trace_on_received(len: usize, text: &str, peer: &str) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!("Received {} bytes from {}: {}", len, peer, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use crate::TrustStore;

    struct WouldBlockReader;

    impl Read for WouldBlockReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[test]
    fn read_chunk_classifies_results() {
        let mut buf = [0u8; 4];
        let mut reader = Cursor::new(b"ping-pong".to_vec());
        assert_eq!(read_chunk(&mut reader, &mut buf).unwrap(), ReadOutcome::Data(4));
        assert_eq!(&buf, b"ping");

        let mut empty = Cursor::new(Vec::new());
        assert_eq!(read_chunk(&mut empty, &mut buf).unwrap(), ReadOutcome::Closed);
        assert_eq!(read_chunk(&mut WouldBlockReader, &mut buf).unwrap(), ReadOutcome::Idle);
    }

    #[test]
    fn remote_address_drops_the_port() {
        let a: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        assert_eq!(remote_address(&a), "127.0.0.1");
        assert_eq!(remote_address(&a), remote_address(&b));
    }

    const TEST_DATA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data");

    #[test]
    fn pem_bundle_yields_every_certificate() {
        let bundle = fs::read(format!("{}/bundle.pem", TEST_DATA)).unwrap();
        assert_eq!(parse_certificates(&bundle).unwrap().len(), 2);

        let single = fs::read(format!("{}/ca.pem", TEST_DATA)).unwrap();
        assert_eq!(parse_certificates(&single).unwrap().len(), 1);
    }

    #[test]
    fn missing_trust_store_fails_before_connecting() {
        let tls = TlsOptions::new().trust_store(TrustStore::new(format!("{}/missing.pem", TEST_DATA)));
        let options = ClientOptions::new("127.0.0.1", 9, "UTF-8").unwrap().tls(Some(tls));

        match connect_stream(&options) {
            Err(S9SocketError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connected without a trust store"),
        }
    }

    #[test]
    fn pkcs12_trust_store_is_loaded_as_identity() {
        let p12 = format!("{}/server.p12", TEST_DATA);

        let tls = TlsOptions::new().trust_store(TrustStore::new(&p12).with_password("s9-test"));
        assert!(build_tls_connector(&tls).is_ok());

        let tls = TlsOptions::new().trust_store(TrustStore::new(&p12).with_password("wrong"));
        assert!(matches!(build_tls_connector(&tls), Err(S9SocketError::Tls(_))));
    }

    #[test]
    fn der_input_without_pem_marker_is_rejected_as_der() {
        assert!(parse_certificates(b"definitely not a certificate").is_err());
    }
}
