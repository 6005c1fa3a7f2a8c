//! The demultiplexer: one thread per bound `UdpSocket` that reads datagrams
//! and routes each to the `ConnectionState` it belongs to, identified by
//! peer address. This thread only decodes and routes; each connection's own
//! engine thread (wired up in `socket.rs`) does the actual processing.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{trace, warn};

use crate::packet::Packet;
use crate::socket::ConnInner;

/// How long a demux thread blocks on `recv_from` before checking `shutdown`,
/// so sockets can be torn down promptly.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Runs the client-side demultiplexer: a socket `connect()`ed to exactly one
/// peer, so every inbound datagram belongs to the single connection it owns.
pub(crate) fn run_client(
    socket: Arc<UdpSocket>,
    conn: Arc<ConnInner>,
    shutdown: Arc<AtomicBool>,
) {
    socket
        .set_read_timeout(Some(POLL_TIMEOUT))
        .expect("setting read timeout on a valid socket cannot fail");

    let mut buf = [0u8; 2048];
    while !shutdown.load(Ordering::Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("client demux recv failed: {e}");
                continue;
            }
        };

        if from != conn.peer {
            trace!("dropping datagram from unexpected peer {from}");
            continue;
        }

        route(&buf[..n], from, &conn);
    }
}

fn route(bytes: &[u8], from: SocketAddr, conn: &Arc<ConnInner>) {
    match Packet::decode(bytes) {
        Ok(pkt) => {
            let mut state = conn.state.lock().unwrap();
            state.recv_raw.push_back(pkt);
            drop(state);
            conn.recv_cv.notify_all();
        }
        Err(e) => warn!("dropping malformed datagram from {from}: {e}"),
    }
}

/// Runs the server-side demultiplexer: a listening socket shared by every
/// accepted connection plus the not-yet-accepted ones. Routes by peer
/// address; an unrecognized peer carrying a SYN becomes a new pending
/// connection.
pub(crate) fn run_server(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<ConnInner>>>>,
    shutdown: Arc<AtomicBool>,
    on_new_peer: impl Fn(SocketAddr, Packet) + Send + 'static,
) {
    socket
        .set_read_timeout(Some(POLL_TIMEOUT))
        .expect("setting read timeout on a valid socket cannot fail");

    let mut buf = [0u8; 2048];
    while !shutdown.load(Ordering::Relaxed) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("server demux recv failed: {e}");
                continue;
            }
        };

        let pkt = match Packet::decode(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("dropping malformed datagram from {from}: {e}");
                continue;
            }
        };

        let existing = peers.lock().unwrap().get(&from).cloned();
        match existing {
            Some(conn) => {
                let mut state = conn.state.lock().unwrap();
                state.recv_raw.push_back(pkt);
                drop(state);
                conn.recv_cv.notify_all();
            }
            None if pkt.syn => {
                trace!("new connection attempt from {from}");
                on_new_peer(from, pkt);
            }
            None => {
                trace!("dropping non-SYN datagram from unknown peer {from}");
            }
        }
    }
}
