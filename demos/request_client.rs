//! One request, one reply, with the blocking client.
//!
//! Usage: `request_client [host] [port] [message]`, defaults to `localhost 7000 "Hello"`.
//! Run one of the echo servers first.

use s9_socket::{ClientOptions, S9BlockingClient};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "localhost".to_string());
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => 7000,
    };
    let message = args.next().unwrap_or_else(|| "Hello".to_string());

    let options = ClientOptions::new(&host, port, "UTF-8")?.nodelay(true);
    let client = S9BlockingClient::new(options);

    match client.send(message.as_bytes()) {
        Some(reply) => println!("Reply: {}", reply),
        None => println!("No reply"),
    }
    Ok(())
}
