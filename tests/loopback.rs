//! End-to-end scenarios over real loopback UDP sockets: handshake + echo,
//! chunked transfer, and two independent concurrent clients against one
//! listener. No packet loss is injected here; that the engine also
//! tolerates real loss is exercised by the retransmission unit tests in
//! `src/engine.rs`.

use std::net::{SocketAddr, TcpListener as PortProbe};
use std::thread;
use std::time::Duration;

use rdt::Config;

/// Picks a free UDP port by briefly binding a TCP listener on `127.0.0.1:0`
/// and reusing its assigned port number, avoiding a fixed port across test
/// runs.
fn free_port() -> u16 {
    PortProbe::bind(("127.0.0.1", 0)).unwrap().local_addr().unwrap().port()
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn fast_config() -> Config {
    Config {
        rto: Duration::from_millis(100),
        tick_interval: Duration::from_millis(20),
        quiet_ticks: 1,
        ..Config::default()
    }
}

#[test]
fn handshake_then_echo_then_close() {
    let port = free_port();
    let listener = rdt::bind(addr(port), fast_config()).unwrap();

    let server = thread::spawn(move || {
        let (stream, _peer) = listener.accept().unwrap();
        let msg = stream.recv().unwrap();
        stream.send(&msg).unwrap();
    });

    let client = rdt::connect(addr(port), fast_config()).unwrap();
    client.send(b"ping").unwrap();
    let echoed = client.recv().unwrap();
    assert_eq!(echoed, b"ping");

    client.close();
    server.join().unwrap();
}

#[test]
fn large_payload_is_chunked_and_reassembled_in_order() {
    let port = free_port();
    let cfg = Config {
        max_payload: 16,
        ..fast_config()
    };

    let server_cfg = cfg.clone();
    let listener = rdt::bind(addr(port), server_cfg).unwrap();

    let payload = vec![7u8; 200];
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let (stream, _peer) = listener.accept().unwrap();
        let mut got = Vec::new();
        while got.len() < expected.len() {
            got.extend(stream.recv().unwrap());
        }
        assert_eq!(got, expected);
    });

    let client = rdt::connect(addr(port), cfg).unwrap();
    client.send(&payload).unwrap();
    client.close();

    server.join().unwrap();
}

#[test]
fn listener_serves_two_clients_independently() {
    let port = free_port();
    let listener = rdt::bind(addr(port), fast_config()).unwrap();

    let server = thread::spawn(move || {
        for _ in 0..2 {
            let (stream, _peer) = listener.accept().unwrap();
            thread::spawn(move || {
                let msg = stream.recv().unwrap();
                stream.send(&msg).unwrap();
            });
        }
    });

    let a = rdt::connect(addr(port), fast_config()).unwrap();
    let b = rdt::connect(addr(port), fast_config()).unwrap();

    a.send(b"from-a").unwrap();
    b.send(b"from-b").unwrap();

    assert_eq!(a.recv().unwrap(), b"from-a");
    assert_eq!(b.recv().unwrap(), b"from-b");

    a.close();
    b.close();
    server.join().unwrap();
}
