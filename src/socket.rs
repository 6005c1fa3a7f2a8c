//! The socket façade: `RdtStream`/`RdtListener` and the per-connection
//! engine thread that ties the reliability engine (`engine.rs`) to a real
//! `UdpSocket`. Each connection gets its own `ConnInner`, a `Mutex`-guarded
//! `ConnectionState` plus a small set of condvars the public methods block
//! on.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;

use crate::conn::{AppItem, ConnectionState, Kind, State};
use crate::config::Config;
use crate::demux;
use crate::engine;
use crate::err::Error;

/// Shared state for one connection: the `Mutex<ConnectionState>` the engine
/// thread owns plus the condvars that let `RdtStream` methods block on it.
pub(crate) struct ConnInner {
    pub(crate) peer: SocketAddr,
    pub(crate) state: Mutex<ConnectionState>,
    /// Notified whenever the demultiplexer appends to `recv_raw`.
    pub(crate) recv_cv: Condvar,
    /// Notified whenever the engine appends to `deliver` (a `recv()` can proceed).
    pub(crate) deliver_cv: Condvar,
    /// Notified whenever the engine dequeues from `send_app` (a blocked `send()` can proceed).
    pub(crate) write_cv: Condvar,
    /// Notified once the connection reaches `Established` (an in-progress `connect()` can proceed).
    pub(crate) estab_cv: Condvar,
}

impl ConnInner {
    fn new(peer: SocketAddr, kind: Kind, iss: u32) -> Arc<ConnInner> {
        Arc::new(ConnInner {
            peer,
            state: Mutex::new(ConnectionState::new(peer, kind, iss)),
            recv_cv: Condvar::new(),
            deliver_cv: Condvar::new(),
            write_cv: Condvar::new(),
            estab_cv: Condvar::new(),
        })
    }
}

fn initial_seq(cfg: &Config) -> u32 {
    if cfg.random_iss {
        rand::thread_rng().gen()
    } else {
        0
    }
}

/// Binds a `UdpSocket`, translating an address-in-use failure into
/// `Error::PortInUse` instead of the generic `Error::Io`.
fn bind_udp(local: SocketAddr) -> Result<UdpSocket, Error> {
    match UdpSocket::bind(local) {
        Ok(socket) => Ok(socket),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(Error::PortInUse(local)),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Picks the caller-visible error for a failed connection: a persistent
/// transport error reports as `TransportFailure`, anything else (ordinary
/// teardown, a reset) as `ConnectionClosed`.
fn failure_error(state: &ConnectionState, peer: SocketAddr) -> Error {
    if state.transport_error {
        Error::TransportFailure(peer)
    } else {
        Error::ConnectionClosed(peer)
    }
}

/// A connected, reliable byte-stream endpoint.
pub struct RdtStream {
    conn: Arc<ConnInner>,
    socket: Arc<UdpSocket>,
    cfg: Config,
    shutdown: Arc<AtomicBool>,
}

/// Runs the per-connection engine loop: retransmission sweep, application
/// send, inbound processing, in that order each tick, blocking on
/// `recv_cv` activity up to `cfg.tick_interval`.
fn run_engine(conn: Arc<ConnInner>, socket: Arc<UdpSocket>, cfg: Config, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let mut state = conn.state.lock().unwrap();

        let outcome = engine::retransmit_sweep(&mut state, &socket, &cfg);
        if outcome.terminated {
            drop(state);
            conn.deliver_cv.notify_all();
            conn.write_cv.notify_all();
            conn.estab_cv.notify_all();
            return;
        }

        let send_outcome = engine::maybe_send_app(&mut state, &socket, &cfg);
        if send_outcome.wake_writer {
            drop(state);
            conn.write_cv.notify_all();
            state = conn.state.lock().unwrap();
        }

        let timed_out = if state.recv_raw.is_empty() {
            let (guard, result) = conn
                .recv_cv
                .wait_timeout_while(state, cfg.tick_interval, |s| {
                    s.recv_raw.is_empty() && !shutdown.load(Ordering::Relaxed)
                })
                .unwrap();
            state = guard;
            result.timed_out()
        } else {
            false
        };

        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        if timed_out {
            engine::note_idle_tick(&mut state);
            if engine::tick_time_wait(&mut state, &cfg) {
                drop(state);
                return;
            }
            continue;
        }

        while let Some(pkt) = state.recv_raw.pop_front() {
            let was_established = state.state == State::Established;
            let outcome = engine::process_inbound(&mut state, pkt, &socket);

            if outcome.wake_reader {
                conn.deliver_cv.notify_all();
            }
            if outcome.established && !was_established {
                conn.estab_cv.notify_all();
            }
            if outcome.terminated {
                drop(state);
                conn.deliver_cv.notify_all();
                conn.write_cv.notify_all();
                conn.estab_cv.notify_all();
                return;
            }
        }

        if engine::tick_time_wait(&mut state, &cfg) {
            drop(state);
            return;
        }
    }
}

impl RdtStream {
    /// Actively opens a connection to `peer`. Blocks until the handshake
    /// completes, the connection fails, or 30 seconds pass.
    pub fn connect(peer: SocketAddr, cfg: Config) -> Result<RdtStream, Error> {
        let socket = bind_udp((std::net::Ipv4Addr::UNSPECIFIED, 0).into())?;
        socket.connect(peer)?;
        let socket = Arc::new(socket);

        let conn = ConnInner::new(peer, Kind::Active, initial_seq(&cfg));
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let mut state = conn.state.lock().unwrap();
            if !engine::send_syn(&mut state, &socket) {
                return Err(Error::TransportFailure(peer));
            }
        }

        {
            let demux_socket = Arc::clone(&socket);
            let demux_conn = Arc::clone(&conn);
            let demux_shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("rdt-demux-{peer}"))
                .spawn(move || demux::run_client(demux_socket, demux_conn, demux_shutdown))
                .expect("spawning demux thread");
        }

        {
            let engine_socket = Arc::clone(&socket);
            let engine_conn = Arc::clone(&conn);
            let engine_cfg = cfg.clone();
            let engine_shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name(format!("rdt-engine-{peer}"))
                .spawn(move || run_engine(engine_conn, engine_socket, engine_cfg, engine_shutdown))
                .expect("spawning engine thread");
        }

        let state = conn.state.lock().unwrap();
        let (state, result) = conn
            .estab_cv
            .wait_timeout_while(state, Duration::from_secs(30), |s| {
                s.state != State::Established && !s.failed
            })
            .unwrap();
        if result.timed_out() || state.failed {
            let err = if state.transport_error {
                Error::TransportFailure(peer)
            } else {
                Error::ConnectionClosed(peer)
            };
            shutdown.store(true, Ordering::Relaxed);
            return Err(err);
        }
        drop(state);

        debug!("connected to {peer}");
        Ok(RdtStream {
            conn,
            socket,
            cfg,
            shutdown,
        })
    }

    fn from_parts(conn: Arc<ConnInner>, socket: Arc<UdpSocket>, cfg: Config, shutdown: Arc<AtomicBool>) -> RdtStream {
        RdtStream {
            conn,
            socket,
            cfg,
            shutdown,
        }
    }

    /// Enqueues `bytes` for delivery, splitting into `cfg.max_payload`-sized
    /// chunks. Blocks while the send queue is full. Only valid once the
    /// connection has reached `Established`; returns `Error::IllegalState`
    /// otherwise.
    pub fn send(&self, bytes: &[u8]) -> Result<(), Error> {
        for chunk in bytes.chunks(self.cfg.max_payload.max(1)) {
            let mut state = self.conn.state.lock().unwrap();
            if state.state != State::Established {
                return Err(Error::IllegalState);
            }
            let (guard, result) = self
                .conn
                .write_cv
                .wait_timeout_while(state, Duration::from_secs(30), |s| {
                    s.send_app.len() >= self.cfg.send_queue_capacity && !s.failed
                })
                .unwrap();
            state = guard;
            if state.failed {
                return Err(failure_error(&state, self.conn.peer));
            }
            if state.state != State::Established {
                return Err(Error::IllegalState);
            }
            if result.timed_out() && state.send_app.len() >= self.cfg.send_queue_capacity {
                return Err(Error::IllegalState);
            }
            state.send_app.push_back(AppItem::Data(chunk.to_vec()));
        }
        Ok(())
    }

    /// Blocks until a full application payload is available and returns it
    /// whole. Deliberately not `impl Read`: a short caller buffer cannot
    /// honor the whole-payload delivery guarantee.
    pub fn recv(&self) -> Result<Vec<u8>, Error> {
        let state = self.conn.state.lock().unwrap();
        let (mut state, _) = self
            .conn
            .deliver_cv
            .wait_timeout_while(state, Duration::from_secs(3600), |s| {
                s.deliver.is_empty() && !s.failed && !matches!(s.state, State::Closed | State::TimeWait)
            })
            .unwrap();

        match state.deliver.pop_front() {
            Some(payload) => Ok(payload),
            None => Err(failure_error(&state, self.conn.peer)),
        }
    }

    /// Enqueues a FIN sentinel and returns immediately; teardown proceeds in
    /// the background rather than blocking until TIME_WAIT expires.
    pub fn close(&self) {
        let mut state = self.conn.state.lock().unwrap();
        if !state.send_app.iter().any(|i| matches!(i, AppItem::Fin)) {
            state.send_app.push_back(AppItem::Fin);
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer
    }
}

impl Drop for RdtStream {
    fn drop(&mut self) {
        self.close();
    }
}

struct PendingConn {
    peer: SocketAddr,
    conn: Arc<ConnInner>,
}

struct ListenerShared {
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<SocketAddr, Arc<ConnInner>>>>,
    pending: Mutex<VecDeque<PendingConn>>,
    pending_cv: Condvar,
    cfg: Config,
    shutdown: Arc<AtomicBool>,
}

/// A passive-open endpoint bound to a local address.
pub struct RdtListener {
    shared: Arc<ListenerShared>,
}

impl RdtListener {
    pub fn bind(local: SocketAddr, cfg: Config) -> Result<RdtListener, Error> {
        let socket = Arc::new(bind_udp(local)?);
        let shared = Arc::new(ListenerShared {
            socket: Arc::clone(&socket),
            peers: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            cfg,
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        let demux_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("rdt-demux-{local}"))
            .spawn(move || {
                let peers = Arc::clone(&demux_shared.peers);
                let shutdown = Arc::clone(&demux_shared.shutdown);
                let on_new = {
                    let shared = Arc::clone(&demux_shared);
                    move |from: SocketAddr, syn: crate::packet::Packet| {
                        accept_new_peer(&shared, from, syn);
                    }
                };
                demux::run_server(demux_shared.socket.clone(), peers, shutdown, on_new)
            })
            .expect("spawning demux thread");

        info!("listening on {local}");
        Ok(RdtListener { shared })
    }

    /// Blocks until a new peer is accepted (enqueued on its first SYN) and
    /// hands it back as an `RdtStream`. The returned stream may still be
    /// completing its handshake (e.g. in `SynRcvd`); `send` returns
    /// `Error::IllegalState` until the connection reaches `Established`.
    pub fn accept(&self) -> Result<(RdtStream, SocketAddr), Error> {
        let pending = self.shared.pending.lock().unwrap();
        let (mut pending, _) = self
            .shared
            .pending_cv
            .wait_timeout_while(pending, Duration::from_secs(3600), |q| q.is_empty())
            .unwrap();

        let entry = pending.pop_front().ok_or(Error::IllegalState)?;
        drop(pending);

        let stream = RdtStream::from_parts(
            Arc::clone(&entry.conn),
            Arc::clone(&self.shared.socket),
            self.shared.cfg.clone(),
            Arc::clone(&self.shared.shutdown),
        );
        Ok((stream, entry.peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.shared.socket.local_addr()?)
    }
}

impl Drop for RdtListener {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Handles an inbound SYN from a peer the server hasn't seen before:
/// creates its `ConnectionState` in `Closed`, registers it in the peer map,
/// enqueues it onto the pending-accept queue immediately, then spawns its
/// engine thread to run the handshake to completion in the background.
/// `accept()` can hand the connection to the application well before it
/// reaches `Established`.
fn accept_new_peer(shared: &Arc<ListenerShared>, from: SocketAddr, syn: crate::packet::Packet) {
    let conn = ConnInner::new(from, Kind::Passive, initial_seq(&shared.cfg));
    shared.peers.lock().unwrap().insert(from, Arc::clone(&conn));

    {
        let mut state = conn.state.lock().unwrap();
        state.recv_raw.push_back(syn);
    }
    conn.recv_cv.notify_all();

    {
        let mut pending = shared.pending.lock().unwrap();
        pending.push_back(PendingConn {
            peer: from,
            conn: Arc::clone(&conn),
        });
        drop(pending);
        shared.pending_cv.notify_all();
    }

    let engine_conn = Arc::clone(&conn);
    let engine_socket = Arc::clone(&shared.socket);
    let engine_cfg = shared.cfg.clone();
    let engine_shutdown = Arc::clone(&shared.shutdown);

    thread::Builder::new()
        .name(format!("rdt-engine-{from}"))
        .spawn(move || run_engine(engine_conn, engine_socket, engine_cfg, engine_shutdown))
        .expect("spawning engine thread");
}
