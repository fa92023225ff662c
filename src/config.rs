//! Configuration for an Rpc endpoint.

use crate::packet::MAX_MSG_SIZE;

/// Default per-session credit bound: the maximum number of requests that
/// may be in flight on one session at any time.
pub const SESSION_CREDITS: usize = 32;

/// Endpoint configuration.
///
/// Knobs cover request multiplexing, flow control, loss recovery, and
/// the congestion controller.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Credits (and request slots) per session.
    /// Default: [`SESSION_CREDITS`]
    pub session_credits: usize,
    /// Maximum sessions per endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// Largest allowed request/response message, in bytes.
    /// Default: 1 MiB
    pub max_msg_size: usize,
    /// RX frames drained from the transport per event-loop iteration.
    /// Default: 16
    pub rx_batch_size: usize,
    /// Retransmission timeout before any RTT has been observed, in
    /// microseconds. Default: 5000
    pub initial_rto_us: u64,
    /// Lower clamp for the RTT-derived retransmission timeout.
    /// Default: 200
    pub rto_min_us: u64,
    /// Upper clamp for the retransmission timeout, including backoff.
    /// Default: 100_000
    pub rto_max_us: u64,
    /// Retransmissions before a request is abandoned.
    /// Default: 5
    pub max_retries: u32,
    /// Interval between session-management retries (connect/disconnect
    /// resends), in microseconds. Default: 2000
    pub sm_retry_interval_us: u64,
    /// Session-management resends before the session is torn down
    /// locally. Default: 64
    pub sm_max_retries: u32,
    /// Enable the rate-based congestion controller. When disabled the
    /// TX path is gated only by credits. Default: false
    pub enable_cc: bool,
    /// Congestion controller parameters.
    pub cc: RateConfig,
    /// Verify that the first byte of a response echoes the first byte of
    /// its request, dropping mismatches. Default: false (length-only
    /// validation).
    pub check_resp_first_byte: bool,
    /// Depth of the background-dispatch completion queue.
    /// Default: 256
    pub bg_queue_depth: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            session_credits: SESSION_CREDITS,
            max_sessions: 256,
            max_msg_size: (1 << 20).min(MAX_MSG_SIZE),
            rx_batch_size: 16,
            initial_rto_us: 5000,
            rto_min_us: 200,
            rto_max_us: 100_000,
            max_retries: 5,
            sm_retry_interval_us: 2000,
            sm_max_retries: 64,
            enable_cc: false,
            cc: RateConfig::default(),
            check_resp_first_byte: false,
            bg_queue_depth: 256,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-session credit count.
    pub fn with_session_credits(mut self, credits: usize) -> Self {
        self.session_credits = credits;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size.min(MAX_MSG_SIZE);
        self
    }

    /// Set the initial retransmission timeout.
    pub fn with_initial_rto_us(mut self, rto_us: u64) -> Self {
        self.initial_rto_us = rto_us;
        self
    }

    /// Set the maximum retransmission count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable the congestion controller.
    pub fn with_cc(mut self, enable_cc: bool) -> Self {
        self.enable_cc = enable_cc;
        self
    }

    /// Set the session-management retry interval.
    pub fn with_sm_retry_interval_us(mut self, us: u64) -> Self {
        self.sm_retry_interval_us = us;
        self
    }

    /// Enable or disable the response first-byte check.
    pub fn with_check_resp_first_byte(mut self, check: bool) -> Self {
        self.check_resp_first_byte = check;
        self
    }
}

/// Congestion controller parameters.
///
/// RTT deltas against `base_rtt_us` drive additive increase and
/// multiplicative decrease of the per-session rate; see [`crate::cc`].
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Expected uncongested round-trip time, in microseconds.
    pub base_rtt_us: u64,
    /// RTT deltas at or below this are treated as uncongested.
    pub low_thresh_us: u64,
    /// RTT deltas at or above this trigger multiplicative decrease.
    pub high_thresh_us: u64,
    /// Additive increase step, bytes/sec per RTT sample.
    pub add_step_bps: f64,
    /// Multiplicative decrease factor in (0, 1).
    pub decrease_factor: f64,
    /// EWMA weight for the RTT gradient.
    pub ewma_alpha: f64,
    /// Rate floor, bytes/sec.
    pub min_rate_bps: f64,
    /// Rate ceiling, bytes/sec.
    pub max_rate_bps: f64,
    /// Initial rate, bytes/sec.
    pub init_rate_bps: f64,
    /// Largest TX burst a session may accumulate while idle, in bytes.
    pub burst_bytes: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            base_rtt_us: 10,
            low_thresh_us: 5,
            high_thresh_us: 50,
            add_step_bps: 5_000_000.0,
            decrease_factor: 0.8,
            ewma_alpha: 0.875,
            min_rate_bps: 1_000_000.0,
            max_rate_bps: 12_500_000_000.0, // 100 Gbit/s
            init_rate_bps: 125_000_000.0,   // 1 Gbit/s
            burst_bytes: 65_536.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = RpcConfig::default()
            .with_session_credits(64)
            .with_initial_rto_us(10_000)
            .with_max_retries(3)
            .with_cc(true);
        assert_eq!(config.session_credits, 64);
        assert_eq!(config.initial_rto_us, 10_000);
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_cc);
    }

    #[test]
    fn msg_size_clamped_to_wire_limit() {
        let config = RpcConfig::default().with_max_msg_size(usize::MAX);
        assert_eq!(config.max_msg_size, MAX_MSG_SIZE);
    }
}
