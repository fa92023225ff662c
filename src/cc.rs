//! Rate-based congestion control driven by RTT gradients.
//!
//! Each session carries a [`RateState`]. Response-packet RTT samples feed
//! [`RateState::on_sample`]; the transmit path spends from a token budget
//! replenished at the current rate, so a throttled session simply stops
//! draining its transmit queue until the budget recovers.

use crate::config::RateConfig;

/// Per-session sending rate and its RTT-gradient bookkeeping.
#[derive(Debug, Clone)]
pub struct RateState {
    rate_bps: f64,
    prev_rtt_us: f64,
    avg_gradient: f64,
    have_sample: bool,
    /// Token budget in bytes. May go negative when a burst overdraws it.
    budget_bytes: f64,
    last_replenish_us: u64,
}

impl RateState {
    pub fn new(cfg: &RateConfig) -> Self {
        Self {
            rate_bps: cfg.init_rate_bps,
            prev_rtt_us: 0.0,
            avg_gradient: 0.0,
            have_sample: false,
            budget_bytes: cfg.burst_bytes,
            last_replenish_us: 0,
        }
    }

    #[inline]
    pub fn rate_bps(&self) -> f64 {
        self.rate_bps
    }

    /// Fold one RTT sample into the rate.
    ///
    /// Below `low_thresh_us` of queueing delay the rate grows additively;
    /// above `high_thresh_us` it is cut multiplicatively. In between, the
    /// smoothed RTT gradient decides the direction.
    pub fn on_sample(&mut self, rtt_us: u64, cfg: &RateConfig) {
        let rtt = rtt_us as f64;
        let delay = rtt - cfg.base_rtt_us as f64;

        if !self.have_sample {
            self.prev_rtt_us = rtt;
            self.have_sample = true;
        }
        let gradient = (rtt - self.prev_rtt_us) / (cfg.base_rtt_us as f64).max(1.0);
        self.avg_gradient =
            cfg.ewma_alpha * self.avg_gradient + (1.0 - cfg.ewma_alpha) * gradient;
        self.prev_rtt_us = rtt;

        if delay <= cfg.low_thresh_us as f64 {
            self.rate_bps += cfg.add_step_bps;
        } else if delay >= cfg.high_thresh_us as f64 {
            self.rate_bps *= cfg.decrease_factor;
        } else if self.avg_gradient <= 0.0 {
            self.rate_bps += cfg.add_step_bps;
        } else {
            self.rate_bps *= 1.0 - (1.0 - cfg.decrease_factor) * self.avg_gradient.min(1.0);
        }

        self.rate_bps = self.rate_bps.clamp(cfg.min_rate_bps, cfg.max_rate_bps);
    }

    /// Top up the token budget for the wall time elapsed since the last
    /// call, capped at one burst.
    pub fn replenish(&mut self, now_us: u64, cfg: &RateConfig) {
        if now_us <= self.last_replenish_us {
            return;
        }
        let dt_s = (now_us - self.last_replenish_us) as f64 / 1e6;
        self.last_replenish_us = now_us;
        self.budget_bytes = (self.budget_bytes + self.rate_bps * dt_s).min(cfg.burst_bytes);
    }

    /// True if the budget covers `bytes`; the caller must then `spend`.
    #[inline]
    pub fn can_send(&self, bytes: usize) -> bool {
        self.budget_bytes >= bytes as f64
    }

    #[inline]
    pub fn spend(&mut self, bytes: usize) {
        self.budget_bytes -= bytes as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_rtt_grows_additively() {
        let cfg = RateConfig::default();
        let mut rs = RateState::new(&cfg);
        let start = rs.rate_bps();
        for _ in 0..10 {
            rs.on_sample(cfg.base_rtt_us as u64, &cfg);
        }
        assert!((rs.rate_bps() - (start + 10.0 * cfg.add_step_bps)).abs() < 1.0);
    }

    #[test]
    fn high_rtt_cuts_multiplicatively() {
        let cfg = RateConfig::default();
        let mut rs = RateState::new(&cfg);
        let start = rs.rate_bps();
        rs.on_sample((cfg.base_rtt_us + cfg.high_thresh_us) as u64 + 10, &cfg);
        assert!((rs.rate_bps() - start * cfg.decrease_factor).abs() < 1.0);
    }

    #[test]
    fn rate_stays_clamped() {
        let cfg = RateConfig::default();
        let mut rs = RateState::new(&cfg);
        for _ in 0..200 {
            rs.on_sample((cfg.base_rtt_us + cfg.high_thresh_us) as u64 * 4, &cfg);
        }
        assert!(rs.rate_bps() >= cfg.min_rate_bps);
        for _ in 0..100_000 {
            rs.on_sample(cfg.base_rtt_us as u64, &cfg);
        }
        assert!(rs.rate_bps() <= cfg.max_rate_bps);
    }

    #[test]
    fn budget_gates_sends() {
        let cfg = RateConfig {
            burst_bytes: 1000.0,
            ..RateConfig::default()
        };
        let mut rs = RateState::new(&cfg);
        assert!(rs.can_send(1000));
        rs.spend(1000);
        assert!(!rs.can_send(1));

        // 1 ms at init_rate_bps more than refills one burst; the budget
        // caps at burst_bytes.
        rs.replenish(1000, &cfg);
        assert!(rs.can_send(1000));
        assert!(!rs.can_send(1001));
    }
}
