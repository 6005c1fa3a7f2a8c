use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::packet::Packet;

/// Connection lifecycle state. `Listen` is carried for completeness but is
/// never observed on a live `ConnectionState`: a server-side connection is
/// created directly in `Closed` on the first inbound SYN, and `Listen`
/// instead describes the owning listener/socket, not an individual
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

/// Whether this connection was created by `connect` (active open) or by the
/// demultiplexer on receipt of a SYN (passive open). Used only for logging
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

/// One entry of `send_app`: either application bytes or the FIN sentinel
/// enqueued by `close()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AppItem {
    Data(Vec<u8>),
    Fin,
}

/// Per-peer reliability state: sequence/ack counters, FSM state, and the
/// four queues that hand work between the demultiplexer, the engine, and the
/// application. Owned exclusively by the connection's engine thread except
/// for `recv_raw` (appended by the demultiplexer) and `send_app` (appended
/// by the application).
pub(crate) struct ConnectionState {
    pub(crate) peer: SocketAddr,
    pub(crate) kind: Kind,
    pub(crate) state: State,

    pub(crate) seq: u32,
    pub(crate) ack: u32,

    pub(crate) recv_raw: VecDeque<Packet>,
    pub(crate) send_app: VecDeque<AppItem>,
    pub(crate) deliver: VecDeque<Vec<u8>>,
    pub(crate) unacked: VecDeque<(Packet, Instant)>,

    /// Sequence number assigned to our own FIN, once sent. Lets the engine
    /// detect "ack of our FIN" (FIN_WAIT_1 -> FIN_WAIT_2) without re-deriving
    /// it from `unacked`, which may already have been drained by the time
    /// the ACK is processed.
    pub(crate) fin_seq: Option<u32>,

    /// Ticks spent in TIME_WAIT so far; substitutes for a wall-clock 2*MSL
    /// timer.
    pub(crate) time_wait_ticks: u32,

    /// Consecutive ticks since the last inbound packet was processed. The
    /// engine only dequeues queued application data once this has reached
    /// `Config::quiet_ticks`, enforcing the stop-and-wait quiet period.
    pub(crate) idle_ticks: u32,

    /// Consecutive retransmissions of the current `unacked` front, used to
    /// enforce `Config::max_retransmits` when set.
    pub(crate) retransmits: u32,

    /// Set when the connection has failed unrecoverably (e.g.
    /// `max_retransmits` exceeded, a persistent transport error, or torn
    /// down) and application operations should stop blocking.
    pub(crate) failed: bool,

    /// Set alongside `failed` when the failure was a persistent transport
    /// error rather than ordinary teardown, so the application sees
    /// `Error::TransportFailure` instead of `Error::ConnectionClosed`.
    pub(crate) transport_error: bool,
}

impl ConnectionState {
    pub(crate) fn new(peer: SocketAddr, kind: Kind, iss: u32) -> Self {
        ConnectionState {
            peer,
            kind,
            state: State::Closed,
            seq: iss,
            ack: 0,
            recv_raw: VecDeque::new(),
            send_app: VecDeque::new(),
            deliver: VecDeque::new(),
            unacked: VecDeque::new(),
            fin_seq: None,
            time_wait_ticks: 0,
            idle_ticks: 0,
            retransmits: 0,
            failed: false,
            transport_error: false,
        }
    }

    /// Our FIN has been sent and cumulatively acknowledged.
    pub(crate) fn our_fin_acked(&self) -> bool {
        match self.fin_seq {
            Some(fin_seq) => {
                !crate::packet::wrapping_lt(self.seq, fin_seq.wrapping_add(1))
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000)
    }

    #[test]
    fn fresh_connection_starts_closed_with_monotonic_counters() {
        let conn = ConnectionState::new(peer(), Kind::Passive, 0);
        assert_eq!(conn.state, State::Closed);
        assert_eq!(conn.seq, 0);
        assert_eq!(conn.ack, 0);
    }

    #[test]
    fn our_fin_acked_requires_seq_past_fin() {
        let mut conn = ConnectionState::new(peer(), Kind::Active, 0);
        conn.fin_seq = Some(10);
        conn.seq = 10;
        assert!(!conn.our_fin_acked());
        conn.seq = 11;
        assert!(conn.our_fin_acked());
    }
}
