//! Callback client that sends a few messages and prints what comes back.
//!
//! Run one of the echo servers first.

use std::thread;
use std::time::Duration;
use s9_socket::{ClientOptions, Lifecycle, S9AsyncCallbackClient, S9ClientListener};

struct EchoListener {
    message_count: usize,
}

impl S9ClientListener for EchoListener {
    fn on_connected(&mut self, remote_address: &str) {
        println!("Connected to {}", remote_address);
    }

    fn on_data_received(&mut self, data: &str) {
        self.message_count += 1;
        println!("Received #{}: {}", self.message_count, data);
    }

    fn on_disconnected(&mut self) {
        println!("Disconnected after {} messages", self.message_count);
    }

    fn on_error(&mut self, error: String) {
        eprintln!("Error: {}", error);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let options = ClientOptions::new("localhost", 7000, "UTF-8")?
        .connect_timeout(Duration::from_secs(5))?;
    let client = S9AsyncCallbackClient::new(options);
    client.set_listener(EchoListener { message_count: 0 });
    client.start_client()?;

    // Sends before the connection is up are dropped with a warning
    while !client.is_connected() {
        if client.state() == Lifecycle::Stopped {
            // Connect failed, already reported through on_error
            thread::sleep(Duration::from_millis(100));
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }

    for i in 1..=3 {
        client.send(format!("Message {}", i).as_bytes());
        thread::sleep(Duration::from_millis(500));
    }

    client.stop_client();
    // Give the dispatch thread a moment to report the disconnect
    thread::sleep(Duration::from_millis(100));
    Ok(())
}
