use std::time::Duration;

/// Runtime-tunable knobs for the reliability engine, lifted out of the
/// engine itself so tests can use shorter timers without touching its logic.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retransmission timeout. Default: 1s.
    pub rto: Duration,
    /// Engine's blocking-recv tick, bounding how soon a retransmission sweep
    /// runs after the timer expires. Default: 500ms.
    pub tick_interval: Duration,
    /// Consecutive quiet ticks required before the engine is allowed to send
    /// queued application data (the stop-and-wait send gate). Default: 3.
    pub quiet_ticks: u32,
    /// Optional cap on consecutive retransmissions of the same packet before
    /// the connection is failed. `None` means unbounded.
    pub max_retransmits: Option<u32>,
    /// Capacity of the application send queue. `send()` blocks while full.
    pub send_queue_capacity: usize,
    /// Largest payload carried in a single data packet.
    pub max_payload: usize,
    /// Whether to pick a random initial sequence number (via `rand`) instead
    /// of zero.
    pub random_iss: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rto: Duration::from_secs(1),
            tick_interval: Duration::from_millis(500),
            quiet_ticks: 3,
            max_retransmits: None,
            send_queue_capacity: 64,
            max_payload: 1024,
            random_iss: false,
        }
    }
}
