mod common;

use std::time::Duration;
use crossbeam_channel::{unbounded, Receiver, Sender};
use s9_socket::{ClientOptions, Lifecycle, S9AsyncCallbackClient, S9ClientListener, S9SocketError};

#[derive(Debug, PartialEq)]
enum Event {
    Connected(String),
    Data(String),
    Disconnected,
    Error(String),
}

struct Recorder(Sender<Event>);

impl S9ClientListener for Recorder {
    fn on_connected(&mut self, remote_address: &str) {
        let _ = self.0.send(Event::Connected(remote_address.to_string()));
    }

    fn on_data_received(&mut self, data: &str) {
        let _ = self.0.send(Event::Data(data.to_string()));
    }

    fn on_disconnected(&mut self) {
        let _ = self.0.send(Event::Disconnected);
    }

    fn on_error(&mut self, error: String) {
        let _ = self.0.send(Event::Error(error));
    }
}

fn client_for(port: u16) -> (S9AsyncCallbackClient, Receiver<Event>) {
    client_polling(port, Duration::from_millis(10))
}

fn client_polling(port: u16, poll_interval: Duration) -> (S9AsyncCallbackClient, Receiver<Event>) {
    common::init_tracing();
    let options = ClientOptions::new("127.0.0.1", port, "UTF-8")
        .unwrap()
        .poll_interval(poll_interval)
        .unwrap();
    let client = S9AsyncCallbackClient::new(options);
    let (tx, rx) = unbounded();
    client.set_listener(Recorder(tx));
    (client, rx)
}

fn next(events: &Receiver<Event>) -> Event {
    events.recv_timeout(common::TIMEOUT).unwrap()
}

#[test]
fn received_data_is_reported_and_stop_disconnects_once() {
    let peer = common::spawn_echo_peer();
    let (client, events) = client_for(peer.port());

    client.start_client().unwrap();
    assert_eq!(next(&events), Event::Connected("127.0.0.1".to_string()));
    assert!(client.is_connected());

    client.send(b"hi");
    assert_eq!(next(&events), Event::Data("hi".to_string()));

    client.stop_client();
    client.stop_client();

    assert_eq!(next(&events), Event::Disconnected);
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!client.is_connected());
    assert_eq!(client.state(), Lifecycle::Stopped);
}

#[test]
fn peer_close_reports_disconnect_then_error() {
    let peer = common::spawn_closing_peer();
    let (client, events) = client_for(peer.port());

    client.start_client().unwrap();

    assert_eq!(next(&events), Event::Connected("127.0.0.1".to_string()));
    assert_eq!(next(&events), Event::Disconnected);
    assert_eq!(next(&events), Event::Error(S9SocketError::ConnectionClosed.to_string()));
    assert_eq!(client.state(), Lifecycle::Stopped);
}

#[test]
fn failed_connect_is_reported_as_error_only() {
    let (client, events) = client_for(common::closed_port());

    client.start_client().unwrap();

    assert!(matches!(next(&events), Event::Error(e) if e.starts_with("Failed to connect")));
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!client.is_connected());
}

#[test]
fn send_before_start_is_dropped_and_restart_is_rejected() {
    let peer = common::spawn_echo_peer();
    let (client, events) = client_for(peer.port());

    client.send(b"too early");
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

    client.start_client().unwrap();
    assert!(matches!(client.start_client(), Err(S9SocketError::InvalidState(_))));
    assert_eq!(next(&events), Event::Connected("127.0.0.1".to_string()));

    client.stop_client();
    assert!(matches!(client.start_client(), Err(S9SocketError::InvalidState(_))));
}

#[test]
fn failed_write_reports_disconnect_then_error() {
    let peer = common::spawn_resetting_peer();
    // A long poll interval keeps the receive loop asleep, so the reset surfaces on a write
    let (client, events) = client_polling(peer.port(), Duration::from_secs(5));

    client.start_client().unwrap();
    assert_eq!(next(&events), Event::Connected("127.0.0.1".to_string()));

    assert!(common::wait_until(|| {
        client.send(b"into the void");
        client.state() == Lifecycle::Stopped
    }));

    assert_eq!(next(&events), Event::Disconnected);
    assert!(matches!(next(&events), Event::Error(e) if e.starts_with("Failed to send")));
    assert!(!client.is_connected());
}
