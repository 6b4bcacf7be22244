use crate::error::S9Result;
use super::options::{Charset, ClientOptions};
use super::shared::{self, ReadOutcome};

// ============================================================================
// S9BlockingClient - Single-shot request/response client
// ============================================================================

/// Synchronous request/response client: connect, send, one read, close.
///
/// Every failure after construction (connect, TLS, write, read) is logged and reported as
/// `None`, which is indistinguishable from a server that sent nothing back.
pub struct S9BlockingClient {
    options: ClientOptions,
}

impl S9BlockingClient {
    pub fn new(options: ClientOptions) -> S9BlockingClient {
        S9BlockingClient { options }
    }

    /// Validates the arguments, then performs one exchange.
    ///
    /// Only invalid arguments produce an `Err`.
    ///
    /// ```no_run
    /// use s9_socket::S9BlockingClient;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let reply = S9BlockingClient::request("localhost", 7000, b"ping", "UTF-8")?;
    /// println!("Received: {:?}", reply);
    /// # Ok(())
    /// # }
    /// ```
    pub fn request(host: &str, port: u16, payload: &[u8], charset: &str) -> S9Result<Option<String>> {
        let options = ClientOptions::new(host, port, charset)?;
        Ok(S9BlockingClient::new(options).send(payload))
    }

    /// Sends the payload and returns whatever a single bounded read yields.
    ///
    /// The reply is decoded with the platform default charset (UTF-8), not the configured one.
    pub fn send(&self, payload: &[u8]) -> Option<String> {
        let peer = format!("{}:{}", self.options.host, self.options.port);

        let mut stream = match shared::connect_stream(&self.options) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", peer, e);
                return None;
            }
        };
        if let Ok(addr) = stream.get_ref().peer_addr() {
            shared::trace_on_connected(&addr, stream.is_tls());
        }

        // Dropping the stream closes it on every path below
        if let Err(e) = shared::write_payload(&mut stream, payload) {
            tracing::error!("Failed to send request to {}: {}", peer, e);
            return None;
        }
        shared::trace_on_sent(payload, self.options.charset, &peer);

        let mut buf = vec![0u8; self.options.read_buffer_size];
        let reply = match shared::read_chunk(&mut stream, &mut buf) {
            Ok(ReadOutcome::Data(n)) => {
                let text = Charset::platform_default().decode(&buf[..n]).into_owned();
                shared::trace_on_received(n, &text, &peer);
                Some(text)
            },
            Ok(ReadOutcome::Closed) => {
                tracing::warn!("Connection to {} closed without a response", peer);
                None
            },
            Ok(ReadOutcome::Idle) => {
                tracing::warn!("No response from {} within {:?}", peer, self.options.read_timeout);
                None
            },
            Err(e) => {
                tracing::error!("Failed to read response from {}: {}", peer, e);
                None
            }
        };

        stream.shutdown();
        tracing::info!("Connection to {} closed", peer);
        reply
    }
}
