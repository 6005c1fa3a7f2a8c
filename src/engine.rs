//! The reliability engine: the three-phase per-connection loop
//! (retransmission sweep, application send, inbound processing) plus the
//! state-transition table it drives. Kept as free functions over
//! `&mut ConnectionState` so its properties can be tested without spinning
//! any threads; `socket.rs` wires these into the actual per-connection
//! thread loop.

use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::config::Config;
use crate::conn::{AppItem, ConnectionState, State};
use crate::packet::{wrapping_lt, wrapping_max, Packet, CONTROL_FILLER};

/// What the caller (the per-connection thread loop) should do after a
/// phase runs: which condition variables to notify, and whether the
/// connection has reached a terminal state.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Outcome {
    pub(crate) wake_reader: bool,
    pub(crate) wake_writer: bool,
    pub(crate) established: bool,
    pub(crate) terminated: bool,
}

fn send(socket: &UdpSocket, peer: SocketAddr, pkt: &Packet) -> std::io::Result<()> {
    socket.send_to(&pkt.encode(), peer)?;
    Ok(())
}

/// Sends `pkt`, and on persistent failure fails the connection outright:
/// marks it closed with `transport_error` set, so the application sees
/// `Error::TransportFailure` on its next call instead of hanging. Returns
/// whether the send succeeded.
fn send_or_fail(conn: &mut ConnectionState, socket: &UdpSocket, pkt: &Packet, outcome: &mut Outcome) -> bool {
    match send(socket, conn.peer, pkt) {
        Ok(()) => true,
        Err(e) => {
            warn!("send to {} failed, failing connection: {e}", conn.peer);
            conn.failed = true;
            conn.transport_error = true;
            conn.state = State::Closed;
            outcome.terminated = true;
            false
        }
    }
}

fn make_ack(conn: &ConnectionState) -> Packet {
    Packet {
        seq: conn.seq,
        ack: conn.ack,
        syn: false,
        ack_flag: true,
        fin: false,
        payload: Vec::new(),
    }
}

fn send_ack(conn: &mut ConnectionState, socket: &UdpSocket, outcome: &mut Outcome) {
    let pkt = make_ack(conn);
    send_or_fail(conn, socket, &pkt, outcome);
}

/// Phase 1 — retransmission sweep.
///
/// Drops cumulatively-acked entries from `unacked`; retransmits any entry
/// whose RTO has elapsed. Returns `Outcome::terminated` if
/// `Config::max_retransmits` was exceeded, or if the retransmit itself hits
/// a persistent transport error.
pub(crate) fn retransmit_sweep(
    conn: &mut ConnectionState,
    socket: &UdpSocket,
    cfg: &Config,
) -> Outcome {
    let now = Instant::now();
    let seq = conn.seq;
    let peer = conn.peer;

    conn.unacked.retain(|(pkt, _)| wrapping_lt(seq, pkt.end_seq()));

    let mut outcome = Outcome::default();
    let mut should_send: Option<Packet> = None;

    if let Some((pkt, t_send)) = conn.unacked.front_mut() {
        if now.duration_since(*t_send) >= cfg.rto {
            if let Some(max) = cfg.max_retransmits {
                if conn.retransmits >= max {
                    warn!("giving up on {peer} after {} retransmissions", conn.retransmits);
                    conn.failed = true;
                    conn.state = State::Closed;
                    outcome.terminated = true;
                    return outcome;
                }
            }
            *t_send = now;
            should_send = Some(pkt.clone());
        }
    }

    if let Some(pkt) = should_send {
        debug!(
            "retransmitting seq={} to {peer} (attempt {})",
            pkt.seq,
            conn.retransmits + 1
        );
        send_or_fail(conn, socket, &pkt, &mut outcome);
        conn.retransmits += 1;
    }

    outcome
}

fn eligible_for_send(conn: &ConnectionState, item: &AppItem) -> bool {
    match (conn.state, item) {
        (State::Established, AppItem::Data(_)) => true,
        (State::Established, AppItem::Fin) => true,
        (State::FinWait1, AppItem::Fin) => true,
        (State::CloseWait, AppItem::Data(_)) => true,
        (State::CloseWait, AppItem::Fin) => true,
        _ => false,
    }
}

/// Phase 2 — application send. Stop-and-wait: only fires once `recv_raw` is
/// empty, `unacked` is empty, and `cfg.quiet_ticks` consecutive ticks have
/// passed with no inbound packet (`conn.idle_ticks`, reset whenever a packet
/// is processed).
pub(crate) fn maybe_send_app(
    conn: &mut ConnectionState,
    socket: &UdpSocket,
    cfg: &Config,
) -> Outcome {
    let mut outcome = Outcome::default();

    if !conn.recv_raw.is_empty() || !conn.unacked.is_empty() || conn.idle_ticks < cfg.quiet_ticks {
        return outcome;
    }

    let Some(item) = conn.send_app.front() else {
        return outcome;
    };

    if !eligible_for_send(conn, item) {
        return outcome;
    }

    let item = conn.send_app.pop_front().unwrap();
    outcome.wake_writer = true;

    let pkt = match item {
        AppItem::Data(bytes) => Packet {
            seq: conn.seq,
            ack: conn.ack,
            syn: false,
            ack_flag: true,
            fin: false,
            payload: bytes,
        },
        AppItem::Fin => {
            conn.fin_seq = Some(conn.seq);
            Packet {
                seq: conn.seq,
                ack: conn.ack,
                syn: false,
                ack_flag: true,
                fin: true,
                payload: CONTROL_FILLER.to_vec(),
            }
        }
    };

    trace!(
        "sending seq={} len={} fin={} to {}",
        pkt.seq,
        pkt.len(),
        pkt.fin,
        conn.peer
    );

    if !send_or_fail(conn, socket, &pkt, &mut outcome) {
        return outcome;
    }

    conn.seq = conn.seq.wrapping_add(pkt.len());
    conn.retransmits = 0;

    let next_state = if pkt.fin {
        match conn.state {
            State::Established => Some(State::FinWait1),
            State::CloseWait => Some(State::LastAck),
            other => Some(other),
        }
    } else {
        None
    };
    if let Some(s) = next_state {
        conn.state = s;
    }

    conn.unacked.push_back((pkt, Instant::now()));

    outcome
}

/// Build the SYN packet `connect()` sends when the engine starts for an
/// actively-opened connection, and register it as unacked. Returns whether
/// the send succeeded; on failure the connection is marked failed with
/// `transport_error` set.
pub(crate) fn send_syn(conn: &mut ConnectionState, socket: &UdpSocket) -> bool {
    let pkt = Packet {
        seq: conn.seq,
        ack: conn.ack,
        syn: true,
        ack_flag: false,
        fin: false,
        payload: CONTROL_FILLER.to_vec(),
    };
    debug!("sending SYN to {}", conn.peer);
    let mut outcome = Outcome::default();
    if !send_or_fail(conn, socket, &pkt, &mut outcome) {
        return false;
    }
    conn.seq = conn.seq.wrapping_add(pkt.len());
    conn.state = State::SynSent;
    conn.unacked.push_back((pkt, Instant::now()));
    true
}

/// Phase 3 — inbound processing. Applies duplicate suppression, cumulative
/// ACK, data application, and exactly one state transition, in that order.
pub(crate) fn process_inbound(conn: &mut ConnectionState, pkt: Packet, socket: &UdpSocket) -> Outcome {
    let mut outcome = Outcome::default();
    conn.idle_ticks = 0;

    // 1. Duplicate suppression.
    if pkt.len() > 0 && wrapping_lt(pkt.seq, conn.ack) {
        trace!("duplicate seq={} from {}, re-acking", pkt.seq, conn.peer);
        send_ack(conn, socket, &mut outcome);
        return outcome;
    }

    // 2. ACK application.
    if pkt.ack_flag {
        conn.seq = wrapping_max(conn.seq, pkt.ack);
    }

    // 3. Data application. A FIN may carry real application data alongside
    // the flag; only a FIN whose payload is just the one-byte sequence
    // filler is excluded from delivery.
    let carries_data = pkt.len() > 0 && !pkt.syn && !pkt.is_bare_fin();
    if pkt.len() > 0 {
        let advanced = wrapping_lt(conn.ack, pkt.end_seq());
        conn.ack = wrapping_max(conn.ack, pkt.end_seq());
        if carries_data && advanced {
            conn.deliver.push_back(pkt.payload.clone());
            outcome.wake_reader = true;
        }
    }

    // 4. State transition — exactly one fires.
    match conn.state {
        State::Closed if pkt.syn => {
            debug!("{}: CLOSED -> SYN_RCVD", conn.peer);
            let synack = Packet {
                seq: conn.seq,
                ack: conn.ack,
                syn: true,
                ack_flag: true,
                fin: false,
                payload: CONTROL_FILLER.to_vec(),
            };
            if send_or_fail(conn, socket, &synack, &mut outcome) {
                conn.seq = conn.seq.wrapping_add(synack.len());
                conn.unacked.push_back((synack, Instant::now()));
                conn.state = State::SynRcvd;
            }
        }
        State::SynSent if pkt.syn && pkt.ack_flag => {
            debug!("{}: SYN_SENT -> ESTABLISHED", conn.peer);
            send_ack(conn, socket, &mut outcome);
            conn.state = State::Established;
            outcome.established = true;
        }
        State::SynRcvd if pkt.ack_flag && !pkt.syn && !pkt.fin => {
            debug!("{}: SYN_RCVD -> ESTABLISHED", conn.peer);
            conn.state = State::Established;
            outcome.established = true;
        }
        State::Established if pkt.fin => {
            debug!("{}: ESTABLISHED -> (FIN received)", conn.peer);
            send_ack(conn, socket, &mut outcome);
            if conn.send_app.is_empty() && conn.unacked.is_empty() {
                let finack = Packet {
                    seq: conn.seq,
                    ack: conn.ack,
                    syn: false,
                    ack_flag: true,
                    fin: true,
                    payload: CONTROL_FILLER.to_vec(),
                };
                conn.fin_seq = Some(conn.seq);
                if send_or_fail(conn, socket, &finack, &mut outcome) {
                    conn.seq = conn.seq.wrapping_add(finack.len());
                    conn.unacked.push_back((finack, Instant::now()));
                    conn.state = State::LastAck;
                    debug!("{}: -> LAST_ACK", conn.peer);
                }
            } else {
                conn.state = State::CloseWait;
                debug!("{}: -> CLOSE_WAIT", conn.peer);
            }
            outcome.wake_reader = true;
        }
        State::Established if carries_data => {
            send_ack(conn, socket, &mut outcome);
        }
        State::FinWait1 if pkt.ack_flag && pkt.fin => {
            send_ack(conn, socket, &mut outcome);
            conn.state = State::TimeWait;
            conn.time_wait_ticks = 0;
            debug!("{}: FIN_WAIT_1 -> TIME_WAIT", conn.peer);
        }
        State::FinWait1 if pkt.ack_flag && conn.our_fin_acked() => {
            conn.state = State::FinWait2;
            debug!("{}: FIN_WAIT_1 -> FIN_WAIT_2", conn.peer);
        }
        State::FinWait2 if pkt.fin => {
            send_ack(conn, socket, &mut outcome);
            conn.state = State::TimeWait;
            conn.time_wait_ticks = 0;
            debug!("{}: FIN_WAIT_2 -> TIME_WAIT", conn.peer);
        }
        State::CloseWait if pkt.fin => {
            // Retransmission of peer's FIN; re-ack, stay put.
            send_ack(conn, socket, &mut outcome);
        }
        State::LastAck if pkt.ack_flag && conn.our_fin_acked() => {
            debug!("{}: LAST_ACK -> CLOSED", conn.peer);
            conn.state = State::Closed;
            outcome.terminated = true;
        }
        State::TimeWait if pkt.fin => {
            // Peer retransmitted its FIN because our ACK was lost; re-ack
            // and restart the quiet-tick countdown.
            send_ack(conn, socket, &mut outcome);
            conn.time_wait_ticks = 0;
        }
        _ => {}
    }

    outcome
}

/// Advances the idle-tick counter used by Phase 2's stop-and-wait send gate.
/// Called once per loop iteration in which no inbound packet arrived.
pub(crate) fn note_idle_tick(conn: &mut ConnectionState) {
    conn.idle_ticks = conn.idle_ticks.saturating_add(1);
}

/// Advances the TIME_WAIT quiet-tick counter; returns `true` once the
/// connection should terminate. Substitutes a tick-counter heuristic for a
/// wall-clock 2*MSL timer.
pub(crate) fn tick_time_wait(conn: &mut ConnectionState, cfg: &Config) -> bool {
    if conn.state != State::TimeWait {
        return false;
    }
    conn.time_wait_ticks += 1;
    if conn.time_wait_ticks >= cfg.quiet_ticks * 2 {
        debug!("{}: TIME_WAIT -> CLOSED", conn.peer);
        conn.state = State::Closed;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Kind;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn bound_socket() -> UdpSocket {
        UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    #[test]
    fn handshake_server_side_reaches_established() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4000), Kind::Passive, 0);

        let syn = Packet {
            seq: 100,
            ack: 0,
            syn: true,
            ack_flag: false,
            fin: false,
            payload: CONTROL_FILLER.to_vec(),
        };
        let out = process_inbound(&mut conn, syn, &socket);
        assert_eq!(conn.state, State::SynRcvd);
        assert!(!out.established);

        let ack = Packet {
            seq: 101,
            ack: conn.seq,
            syn: false,
            ack_flag: true,
            fin: false,
            payload: Vec::new(),
        };
        let out = process_inbound(&mut conn, ack, &socket);
        assert_eq!(conn.state, State::Established);
        assert!(out.established);
    }

    #[test]
    fn duplicate_data_is_not_delivered_twice() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4001), Kind::Passive, 0);
        conn.state = State::Established;
        conn.ack = 100;

        let dup = Packet {
            seq: 50,
            ack: 0,
            syn: false,
            ack_flag: false,
            fin: false,
            payload: b"replay".to_vec(),
        };
        let out = process_inbound(&mut conn, dup, &socket);
        assert!(conn.deliver.is_empty());
        assert!(!out.wake_reader);
        assert_eq!(conn.ack, 100);
    }

    #[test]
    fn fresh_data_is_delivered_once() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4002), Kind::Passive, 0);
        conn.state = State::Established;
        conn.ack = 10;

        let data = Packet {
            seq: 10,
            ack: 0,
            syn: false,
            ack_flag: false,
            fin: false,
            payload: b"hello".to_vec(),
        };
        let out = process_inbound(&mut conn, data, &socket);
        assert!(out.wake_reader);
        assert_eq!(conn.deliver.len(), 1);
        assert_eq!(conn.deliver[0], b"hello");
        assert_eq!(conn.ack, 15);
    }

    #[test]
    fn ack_cumulativity_clears_unacked_up_to_ack() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4003), Kind::Active, 0);
        conn.state = State::Established;
        conn.seq = 5;
        conn.unacked.push_back((
            Packet {
                seq: 0,
                ack: 0,
                syn: false,
                ack_flag: true,
                fin: false,
                payload: vec![0; 5],
            },
            Instant::now(),
        ));

        let cfg = Config::default();
        let ack = Packet {
            seq: 0,
            ack: 5,
            syn: false,
            ack_flag: true,
            fin: false,
            payload: Vec::new(),
        };
        process_inbound(&mut conn, ack, &socket);
        retransmit_sweep(&mut conn, &socket, &cfg);

        assert!(conn.unacked.is_empty());
    }

    #[test]
    fn seq_and_ack_never_decrease_across_acks() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4004), Kind::Active, 0);
        conn.state = State::Established;
        conn.seq = 100;

        let stale_ack = Packet {
            seq: 0,
            ack: 10,
            syn: false,
            ack_flag: true,
            fin: false,
            payload: Vec::new(),
        };
        process_inbound(&mut conn, stale_ack, &socket);
        assert_eq!(conn.seq, 100);
    }

    #[test]
    fn retransmission_sweep_resends_after_rto_and_is_idempotent() {
        let socket = bound_socket();
        let peer = UdpSocket::bind((std::net::Ipv4Addr::LOCALHOST, 0)).unwrap();
        peer.set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();

        let mut conn = ConnectionState::new(peer.local_addr().unwrap(), Kind::Active, 0);
        conn.state = State::Established;
        let mut cfg = Config::default();
        cfg.rto = std::time::Duration::from_millis(1);

        let pkt = Packet {
            seq: 0,
            ack: 0,
            syn: false,
            ack_flag: true,
            fin: false,
            payload: b"x".to_vec(),
        };
        conn.unacked
            .push_back((pkt.clone(), Instant::now() - std::time::Duration::from_secs(1)));

        retransmit_sweep(&mut conn, &socket, &cfg);
        let mut buf = [0u8; 64];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        let got = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(got, pkt);

        // Applying the sweep again before a new RTO elapses must not resend.
        retransmit_sweep(&mut conn, &socket, &Config { rto: std::time::Duration::from_secs(60), ..Config::default() });
        assert!(peer.recv_from(&mut buf).is_err());
    }

    #[test]
    fn time_wait_terminates_after_quiet_ticks() {
        let mut conn = ConnectionState::new(addr(4005), Kind::Active, 0);
        conn.state = State::TimeWait;
        let cfg = Config {
            quiet_ticks: 2,
            ..Config::default()
        };
        assert!(!tick_time_wait(&mut conn, &cfg));
        assert!(!tick_time_wait(&mut conn, &cfg));
        assert!(tick_time_wait(&mut conn, &cfg));
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn combined_fin_and_data_still_delivers_the_payload() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4006), Kind::Passive, 0);
        conn.state = State::Established;
        conn.ack = 10;

        let fin_with_data = Packet {
            seq: 10,
            ack: 0,
            syn: false,
            ack_flag: false,
            fin: true,
            payload: b"trailer".to_vec(),
        };
        let out = process_inbound(&mut conn, fin_with_data, &socket);
        assert!(out.wake_reader);
        assert_eq!(conn.deliver.len(), 1);
        assert_eq!(conn.deliver[0], b"trailer");
        assert_eq!(conn.state, State::CloseWait);
    }

    #[test]
    fn bare_fin_filler_byte_is_not_delivered_as_data() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4007), Kind::Passive, 0);
        conn.state = State::Established;
        conn.ack = 10;

        let bare_fin = Packet {
            seq: 10,
            ack: 0,
            syn: false,
            ack_flag: false,
            fin: true,
            payload: CONTROL_FILLER.to_vec(),
        };
        let out = process_inbound(&mut conn, bare_fin, &socket);
        assert!(conn.deliver.is_empty());
        assert!(!out.wake_reader);
        assert_eq!(conn.state, State::CloseWait);
    }

    #[test]
    fn app_send_waits_for_quiet_ticks_before_firing() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4008), Kind::Active, 0);
        conn.state = State::Established;
        conn.send_app.push_back(AppItem::Data(b"hi".to_vec()));

        let cfg = Config {
            quiet_ticks: 3,
            ..Config::default()
        };

        // Not enough idle ticks yet: nothing should be sent.
        note_idle_tick(&mut conn);
        note_idle_tick(&mut conn);
        let out = maybe_send_app(&mut conn, &socket, &cfg);
        assert!(!out.wake_writer);
        assert_eq!(conn.send_app.len(), 1);

        // One more idle tick reaches the threshold.
        note_idle_tick(&mut conn);
        let out = maybe_send_app(&mut conn, &socket, &cfg);
        assert!(out.wake_writer);
        assert!(conn.send_app.is_empty());
    }

    #[test]
    fn inbound_packet_resets_the_idle_tick_counter() {
        let socket = bound_socket();
        let mut conn = ConnectionState::new(addr(4009), Kind::Active, 0);
        conn.state = State::Established;
        conn.idle_ticks = 5;

        let ack = Packet {
            seq: 0,
            ack: 0,
            syn: false,
            ack_flag: true,
            fin: false,
            payload: Vec::new(),
        };
        process_inbound(&mut conn, ack, &socket);
        assert_eq!(conn.idle_ticks, 0);
    }
}
