//! Connection quality metrics with EWMA filtering and adaptive scoring.
//!
//! Every transport maintains one [`ConnectionQuality`] per peer. The
//! registry caches these and feeds them to the selection strategies; the
//! `Adaptive` strategy calls [`ConnectionQuality::compute_score`] with a
//! [`SelectionContext`] describing the pending send.

use std::time::Instant;

/// EWMA smoothing factor (0.1 = slow adaptation, 0.3 = faster).
pub const EWMA_ALPHA: f64 = 0.2;

/// RTT thresholds in milliseconds.
pub const RTT_EXCELLENT: f64 = 50.0;
/// RTT below this is still usable without penalty.
pub const RTT_GOOD: f64 = 150.0;
/// RTT above this saturates the normalised score.
pub const RTT_FAIR: f64 = 300.0;

/// Loss thresholds in percent.
pub const LOSS_EXCELLENT: f64 = 0.1;
/// Loss below this is acceptable for bulk traffic.
pub const LOSS_GOOD: f64 = 1.0;
/// Loss above this saturates the normalised score.
pub const LOSS_FAIR: f64 = 5.0;

/// Jitter thresholds in milliseconds.
pub const JITTER_EXCELLENT: f64 = 5.0;
/// Jitter below this is acceptable.
pub const JITTER_GOOD: f64 = 20.0;
/// Jitter above this saturates the normalised score.
pub const JITTER_FAIR: f64 = 50.0;

/// Bandwidth thresholds in bytes per second.
pub const BANDWIDTH_EXCELLENT: f64 = 10.0 * 1024.0 * 1024.0;
/// Bandwidth above this is considered good.
pub const BANDWIDTH_GOOD: f64 = 5.0 * 1024.0 * 1024.0;
/// Bandwidth below this saturates the normalised score.
pub const BANDWIDTH_FAIR: f64 = 1.0 * 1024.0 * 1024.0;

/// Congestion-level thresholds (0..1 scale).
pub const CONGESTION_EXCELLENT: f64 = 0.1;
/// Congestion below this is acceptable.
pub const CONGESTION_GOOD: f64 = 0.3;
/// Congestion above this saturates the normalised score.
pub const CONGESTION_FAIR: f64 = 0.6;

/// Queue-delay thresholds in milliseconds.
pub const QUEUE_DELAY_EXCELLENT: f64 = 10.0;
/// Queue delay below this is acceptable.
pub const QUEUE_DELAY_GOOD: f64 = 50.0;
/// Queue delay above this saturates the normalised score.
pub const QUEUE_DELAY_FAIR: f64 = 100.0;

/// Context describing a pending send, used for adaptive weighting.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    /// Target peer
    pub peer_id: String,
    /// Size hint for the payload about to be sent
    pub payload_size: usize,
    /// Delivery must be guaranteed
    pub requires_reliability: bool,
    /// Caller prefers latency over throughput
    pub low_latency: bool,
}

/// Connection quality metrics for one peer on one transport.
#[derive(Debug, Clone)]
pub struct ConnectionQuality {
    /// Last raw RTT measurement in milliseconds (-1 = never measured)
    pub rtt_ms: f64,
    /// Last raw jitter measurement in milliseconds
    pub jitter_ms: f64,
    /// Last raw packet loss in percent
    pub loss_percent: f64,
    /// Last measured bandwidth in bytes per second
    pub bandwidth_bps: f64,
    /// Maximum bandwidth ever observed
    pub max_bandwidth_bps: f64,
    /// Measured queue delay in milliseconds
    pub queue_delay_ms: f64,
    /// Congestion detected flag
    pub congested: bool,

    /// EWMA-filtered RTT (-1 until first sample)
    pub ewma_rtt_ms: f64,
    /// EWMA-filtered jitter
    pub ewma_jitter_ms: f64,
    /// EWMA-filtered loss percent
    pub ewma_loss_percent: f64,
    /// EWMA-filtered bandwidth
    pub ewma_bandwidth_bps: f64,
    /// EWMA-filtered congestion level (0..1)
    pub ewma_congestion: f64,

    /// When any field was last updated
    pub last_updated: Option<Instant>,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            rtt_ms: -1.0,
            jitter_ms: 0.0,
            loss_percent: 0.0,
            bandwidth_bps: 0.0,
            max_bandwidth_bps: 0.0,
            queue_delay_ms: 0.0,
            congested: false,
            ewma_rtt_ms: -1.0,
            ewma_jitter_ms: 0.0,
            ewma_loss_percent: 0.0,
            ewma_bandwidth_bps: 0.0,
            ewma_congestion: 0.0,
            last_updated: None,
        }
    }
}

impl ConnectionQuality {
    /// Feed a new (RTT, jitter, loss) measurement into the EWMA filters.
    pub fn update_ewma(&mut self, rtt_ms: f64, jitter_ms: f64, loss_percent: f64) {
        if self.ewma_rtt_ms < 0.0 {
            self.ewma_rtt_ms = rtt_ms;
            self.ewma_jitter_ms = jitter_ms;
            self.ewma_loss_percent = loss_percent;
        } else {
            self.ewma_rtt_ms = EWMA_ALPHA * rtt_ms + (1.0 - EWMA_ALPHA) * self.ewma_rtt_ms;
            self.ewma_jitter_ms = EWMA_ALPHA * jitter_ms + (1.0 - EWMA_ALPHA) * self.ewma_jitter_ms;
            self.ewma_loss_percent =
                EWMA_ALPHA * loss_percent + (1.0 - EWMA_ALPHA) * self.ewma_loss_percent;
        }
        self.rtt_ms = rtt_ms;
        self.jitter_ms = jitter_ms;
        self.loss_percent = loss_percent;
        self.last_updated = Some(Instant::now());
    }

    /// Feed a bandwidth measurement.
    pub fn update_bandwidth(&mut self, bps: f64) {
        self.bandwidth_bps = bps;
        if self.ewma_bandwidth_bps == 0.0 {
            self.ewma_bandwidth_bps = bps;
        } else {
            self.ewma_bandwidth_bps = EWMA_ALPHA * bps + (1.0 - EWMA_ALPHA) * self.ewma_bandwidth_bps;
        }
        if bps > self.max_bandwidth_bps {
            self.max_bandwidth_bps = bps;
        }
        self.last_updated = Some(Instant::now());
    }

    /// Feed congestion metrics: queue delay and retransmission rate.
    ///
    /// The congestion level is normalised to 0..1 where 1 is saturated.
    pub fn update_congestion(&mut self, queue_delay_ms: f64, retransmission_rate: f64) {
        self.queue_delay_ms = queue_delay_ms;

        let level = (queue_delay_ms / 100.0 + retransmission_rate / 10.0).min(1.0);
        if self.ewma_congestion == 0.0 {
            self.ewma_congestion = level;
        } else {
            self.ewma_congestion = EWMA_ALPHA * level + (1.0 - EWMA_ALPHA) * self.ewma_congestion;
        }
        self.congested = level > 0.5;
        self.last_updated = Some(Instant::now());
    }

    /// Quality degraded beyond the fair thresholds on any axis.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.ewma_rtt_ms > RTT_FAIR
            || self.ewma_loss_percent > LOSS_FAIR
            || self.ewma_jitter_ms > JITTER_FAIR
            || (self.ewma_bandwidth_bps > 0.0 && self.ewma_bandwidth_bps < BANDWIDTH_FAIR)
            || self.ewma_congestion > CONGESTION_FAIR
            || self.queue_delay_ms > QUEUE_DELAY_FAIR
    }

    /// Quality is excellent on every axis (no reason to switch transports).
    #[must_use]
    pub fn is_excellent(&self) -> bool {
        self.ewma_rtt_ms > 0.0
            && self.ewma_rtt_ms < RTT_EXCELLENT
            && self.ewma_loss_percent < LOSS_EXCELLENT
            && self.ewma_jitter_ms < JITTER_EXCELLENT
            && self.ewma_bandwidth_bps > BANDWIDTH_EXCELLENT
            && self.ewma_congestion < CONGESTION_EXCELLENT
            && self.queue_delay_ms < QUEUE_DELAY_EXCELLENT
    }

    /// Composite score for adaptive selection; lower is better.
    ///
    /// Weights shift with the context: latency-sensitive sends weight RTT
    /// up, payloads over 1 MiB weight bandwidth up, reliable delivery
    /// weights loss and jitter up. A congested link takes a 1.5x penalty.
    /// Returns infinity when no RTT has ever been measured.
    #[must_use]
    pub fn compute_score(&self, context: &SelectionContext) -> f64 {
        if self.ewma_rtt_ms < 0.0 {
            return f64::INFINITY;
        }

        let rtt_score = normalize(self.ewma_rtt_ms, 0.0, RTT_FAIR, true);
        let loss_score = normalize(self.ewma_loss_percent, 0.0, LOSS_FAIR, true);
        let jitter_score = normalize(self.ewma_jitter_ms, 0.0, JITTER_FAIR, true);
        let bandwidth_score = normalize(
            self.ewma_bandwidth_bps,
            BANDWIDTH_FAIR,
            BANDWIDTH_EXCELLENT,
            false,
        );
        let congestion_score = normalize(self.ewma_congestion, 0.0, 1.0, true);

        let w_rtt = if context.low_latency { 0.4 } else { 0.2 };
        let w_bw = if context.payload_size > 1024 * 1024 {
            0.3
        } else {
            0.2
        };
        let w_rel = if context.requires_reliability { 0.3 } else { 0.2 };
        let w_cong = 0.2;

        let mut score = w_rtt * rtt_score
            + w_bw * bandwidth_score
            + w_rel * (loss_score + jitter_score)
            + w_cong * congestion_score;

        if self.congested {
            score *= 1.5;
        }
        score
    }
}

/// Normalise a value into 0..1 against [min, max], saturating outside.
///
/// With `lower_is_better` the normalised value is returned directly (0 is
/// best); otherwise it is inverted (1 - n).
fn normalize(value: f64, min: f64, max: f64, lower_is_better: bool) -> f64 {
    if max <= min {
        return 0.0;
    }
    let n = ((value - min) / (max - min)).clamp(0.0, 1.0);
    if lower_is_better { n } else { 1.0 - n }
}
