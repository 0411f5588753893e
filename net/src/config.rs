//! Transport tuning knobs.
//!
//! Plain data with defaults; no file, CLI, or environment parsing — the
//! configuration surface proper is external to this workspace.  Everything
//! the state machine clamps or schedules against lives here so tests can
//! pin the values they exercise.

/// TCP configuration, shared by every connection on a host.
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Maximum segment size: payload bytes per data packet.
    pub mss: usize,

    /// Initial send buffer size in bytes (before autotuning).
    pub send_buf_initial: usize,
    /// Initial receive buffer size in bytes (before autotuning).
    pub recv_buf_initial: usize,
    /// Send buffer clamp.
    pub send_buf_min: usize,
    pub send_buf_max: usize,
    /// Receive buffer clamp.
    pub recv_buf_min: usize,
    pub recv_buf_max: usize,

    /// Retransmission timeout before the first RTT sample, in ms.
    pub rto_initial_ms: u32,
    /// RTO clamp (RFC 6298 leaves the bounds to the implementation).
    pub rto_min_ms: u32,
    pub rto_max_ms: u32,

    /// Delayed-ACK delay for the first `quick_ack_threshold` acks, in ms.
    pub delayed_ack_early_ms: u64,
    /// Delayed-ACK delay afterwards, in ms.
    pub delayed_ack_late_ms: u64,
    /// How many quick acks a connection sends before switching to the
    /// longer delay.
    pub quick_ack_threshold: u32,

    /// TIME_WAIT dwell before the descriptor fully closes, in ms.
    pub time_wait_ms: u64,

    /// Initial congestion window, in packets.
    pub initial_cwnd: u32,

    /// Whether buffer autotuning runs at all.
    pub autotune: bool,
}

impl TcpConfig {
    /// Ethernet-shaped default MSS (1500 − IP 20 − TCP 32 with options).
    pub const DEFAULT_MSS: usize = 1448;

    pub fn new() -> Self {
        Self {
            mss: Self::DEFAULT_MSS,
            send_buf_initial: 65_536,
            recv_buf_initial: 65_536,
            send_buf_min: 4_096,
            send_buf_max: 4_194_304,
            recv_buf_min: 4_096,
            recv_buf_max: 4_194_304,
            rto_initial_ms: 1_000,
            rto_min_ms: 200,
            rto_max_ms: 60_000,
            delayed_ack_early_ms: 1,
            delayed_ack_late_ms: 5,
            quick_ack_threshold: 1_000,
            time_wait_ms: 60_000,
            initial_cwnd: 10,
            autotune: true,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new()
    }
}
