//! Thread-per-connection echo server.
//!
//! Every received chunk is echoed to all connections from the same host, so two clients
//! started on one machine see each other's messages.
//!
//! Try it with `nc localhost 7000` from two terminals. Press Enter to stop the server.

use std::io::BufRead;
use s9_socket::{AcceptorKind, S9BlockingServer, ServerOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // Pass "channel" as first argument to use the socket2 acceptor
    let kind = match std::env::args().nth(1).as_deref() {
        Some("channel") => AcceptorKind::Channel,
        _ => AcceptorKind::Stream,
    };

    let options = ServerOptions::new(7000, "UTF-8")?
        .nodelay(true)
        .worker_threads(16)?;
    let mut server = S9BlockingServer::new(options, kind);
    server.start()?;
    println!("Echo server listening on {:?}, press Enter to stop", server.local_addr());

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    println!("Stopping with {} open connections: {:?}", server.connection_count(), server.remote_addresses());
    server.stop();
    Ok(())
}
