//! Single-threaded reactor echo server.
//!
//! Besides echoing, a background thread pushes a heartbeat to every local client through
//! the reactor handle every five seconds. Press Enter to stop the server.

use std::io::BufRead;
use std::thread;
use std::time::Duration;
use s9_socket::{S9ReactorServer, ServerOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let options = ServerOptions::new(7000, "UTF-8")?;
    let mut server = S9ReactorServer::new(options);
    server.start()?;
    println!("Reactor listening on {:?}, press Enter to stop", server.local_addr());

    if let Some(handle) = server.handle() {
        thread::spawn(move || loop {
            thread::sleep(Duration::from_secs(5));
            let delivered = handle.send_to("127.0.0.1", b"heartbeat\n");
            println!("Heartbeat queued for {} connections", delivered);
        });
    }

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    for connection in server.connections() {
        println!("Closing {} from {} ({:?})", connection.id, connection.remote_address, connection.readiness);
    }
    server.stop();
    Ok(())
}
