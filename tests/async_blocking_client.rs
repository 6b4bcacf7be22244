mod common;

use std::thread;
use std::time::Duration;
use s9_socket::{ClientOptions, Lifecycle, S9AsyncBlockingClient, S9SocketError};

fn client_for(port: u16) -> S9AsyncBlockingClient {
    common::init_tracing();
    let options = ClientOptions::new("127.0.0.1", port, "UTF-8")
        .unwrap()
        .read_timeout(common::TIMEOUT)
        .unwrap();
    S9AsyncBlockingClient::new(options)
}

#[test]
fn send_before_start_is_dropped_without_error() {
    let peer = common::spawn_echo_peer();
    let client = client_for(peer.port());

    client.send(b"too early");

    assert_eq!(client.state(), Lifecycle::Created);
    assert!(!client.is_connected());
    assert_eq!(client.receive(), None);
}

#[test]
fn start_send_receive_stop() {
    let peer = common::spawn_echo_peer();
    let client = client_for(peer.port());

    client.start().unwrap();
    assert_eq!(client.state(), Lifecycle::Running);
    assert!(common::wait_until(|| client.is_connected()));

    client.send(b"hello");
    assert_eq!(client.receive().as_deref(), Some("hello"));

    client.send("grüße".as_bytes());
    assert_eq!(client.receive().as_deref(), Some("grüße"));

    client.stop();
    assert!(!client.is_connected());
    assert_eq!(client.receive(), None);
}

#[test]
fn stop_twice_is_harmless_and_restart_is_rejected() {
    let peer = common::spawn_echo_peer();
    let client = client_for(peer.port());
    client.start().unwrap();
    assert!(matches!(client.start(), Err(S9SocketError::InvalidState(_))));
    assert!(common::wait_until(|| client.is_connected()));

    client.stop();
    client.stop();

    assert_eq!(client.state(), Lifecycle::Stopped);
    assert!(matches!(client.start(), Err(S9SocketError::InvalidState(_))));
    client.send(b"after stop");
}

#[test]
fn failed_connect_leaves_the_client_disconnected() {
    let client = client_for(common::closed_port());

    client.start().unwrap();
    thread::sleep(Duration::from_millis(300));

    assert!(!client.is_connected());
    assert_eq!(client.state(), Lifecycle::Running);
    client.stop();
}

#[test]
fn peer_close_stops_the_client() {
    let peer = common::spawn_closing_peer();
    let client = client_for(peer.port());
    client.start().unwrap();
    assert!(common::wait_until(|| client.is_connected()));

    assert_eq!(client.receive(), None);

    assert!(!client.is_connected());
    assert_eq!(client.state(), Lifecycle::Stopped);
}

#[test]
fn failed_write_stops_the_client() {
    let peer = common::spawn_resetting_peer();
    let client = client_for(peer.port());
    client.start().unwrap();
    assert!(common::wait_until(|| client.is_connected() || client.state() == Lifecycle::Stopped));

    let stopped = common::wait_until(|| {
        client.send(b"into the void");
        client.state() == Lifecycle::Stopped
    });

    assert!(stopped);
    assert!(!client.is_connected());
    assert_eq!(client.receive(), None);
}
