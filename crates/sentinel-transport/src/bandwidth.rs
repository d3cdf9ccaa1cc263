//! Token-bucket bandwidth limiting with optional LEDBAT-style congestion
//! control.
//!
//! A limiter with rate 0 is unlimited and only accounts bytes. Bucket
//! capacity defaults to twice the configured rate. [`BandwidthLimiter::request`]
//! suspends cooperatively (never more than 100 ms per sleep) until the
//! deduction completes; backpressure is never an error.
//!
//! With congestion control enabled the limiter keeps a sliding window of
//! RTT samples, tracks a slowly-drifting minimum, and adjusts its rate at
//! most every 100 ms:
//!
//! ```text
//! rate ← rate + GAIN · (target_delay − queue_delay) · rate / target_delay
//! ```
//!
//! bounded to `[MIN_RATE, configured_max]`, with single-step increases
//! capped at 1.25x. A packet-loss report halves the rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Rate adjustment gain.
const GAIN: f64 = 1.0;

/// Floor for the adjusted rate in bytes per second.
const MIN_RATE: u64 = 1024;

/// Cap on a single multiplicative rate increase.
const MAX_RATE_INCREASE: f64 = 1.25;

/// Multiplicative decrease applied on packet loss.
const DECREASE_FACTOR: f64 = 0.5;

/// Sliding RTT window depth.
const RTT_HISTORY_SIZE: usize = 32;

/// Minimum interval between rate adjustments.
const ADJUST_INTERVAL: Duration = Duration::from_millis(100);

/// Longest single cooperative sleep inside `request`.
const MAX_SLEEP: Duration = Duration::from_millis(100);

/// Default LEDBAT target queue delay in milliseconds.
pub const DEFAULT_TARGET_DELAY_MS: f64 = 100.0;

/// Congestion statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct CongestionStats {
    /// Most recent RTT sample in milliseconds
    pub current_rtt_ms: f64,
    /// Tracked minimum RTT in milliseconds
    pub min_rtt_ms: f64,
    /// Estimated queue delay (current − min) in milliseconds
    pub queue_delay_ms: f64,
    /// Target queue delay in milliseconds
    pub target_delay_ms: f64,
    /// Current adjusted rate in bytes per second
    pub current_rate: u64,
    /// Packets reported lost
    pub packets_lost: u64,
    /// Packets reported sent
    pub packets_sent: u64,
    /// Loss ratio over everything reported
    pub loss_rate: f64,
}

/// Cumulative transfer statistics for one limiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimiterStats {
    /// Total bytes admitted through the limiter
    pub total_bytes: u64,
    /// Cumulative milliseconds spent waiting in `request`
    pub total_wait_ms: u64,
}

struct CongestionState {
    rtt_history: VecDeque<f64>,
    current_rtt: f64,
    /// 1000.0 is the "never measured" sentinel.
    min_rtt: f64,
    queue_delay: f64,
    target_delay: f64,
    last_adjustment: Instant,
    packets_lost: u64,
    packets_sent: u64,
}

impl CongestionState {
    fn new(target_delay_ms: f64) -> Self {
        Self {
            rtt_history: VecDeque::with_capacity(RTT_HISTORY_SIZE),
            current_rtt: 0.0,
            min_rtt: 1000.0,
            queue_delay: 0.0,
            target_delay: target_delay_ms,
            last_adjustment: Instant::now(),
            packets_lost: 0,
            packets_sent: 0,
        }
    }
}

struct LimiterState {
    /// Current effective rate; may sit below `configured_max` under
    /// congestion control. Zero means unlimited.
    rate: u64,
    configured_max: u64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    congestion: Option<CongestionState>,
}

impl LimiterState {
    fn new(rate: u64, congestion: Option<CongestionState>) -> Self {
        let capacity = (rate * 2) as f64;
        Self {
            rate,
            configured_max: rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
            congestion,
        }
    }

    fn refill(&mut self) {
        if self.rate == 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + self.rate as f64 * elapsed).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn apply_rate(&mut self, new_rate: u64) {
        self.rate = new_rate;
        self.capacity = (new_rate * 2) as f64;
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Token-bucket rate limiter for one direction of traffic.
pub struct BandwidthLimiter {
    state: Mutex<LimiterState>,
    /// Mirror of the current rate for lock-free reads.
    rate_hint: AtomicU64,
    total_bytes: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl BandwidthLimiter {
    /// Create a limiter with the given rate (0 = unlimited), no
    /// congestion control.
    #[must_use]
    pub fn new(rate: u64) -> Self {
        Self {
            state: Mutex::new(LimiterState::new(rate, None)),
            rate_hint: AtomicU64::new(rate),
            total_bytes: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Create a limiter with LEDBAT-style congestion control enabled.
    #[must_use]
    pub fn with_congestion_control(rate: u64, target_delay_ms: f64) -> Self {
        Self {
            state: Mutex::new(LimiterState::new(
                rate,
                Some(CongestionState::new(target_delay_ms)),
            )),
            rate_hint: AtomicU64::new(rate),
            total_bytes: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Current effective rate in bytes per second (0 = unlimited).
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.rate_hint.load(Ordering::Relaxed)
    }

    /// Whether the limiter enforces a rate.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.rate() > 0
    }

    /// Block cooperatively until `bytes` tokens have been deducted.
    ///
    /// Returns only when the deduction is complete. Waiting tasks are
    /// served roughly in arrival order (the internal mutex queues fairly).
    /// A request larger than the bucket capacity is admitted once the
    /// bucket is full, driving the balance negative so long-term
    /// throughput stays bounded by the rate.
    pub async fn request(&self, bytes: usize) {
        let start = Instant::now();
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                if st.rate == 0 {
                    break;
                }
                st.refill();
                let want = bytes as f64;
                if st.tokens >= want || st.tokens >= st.capacity {
                    st.tokens -= want;
                    break;
                }
                let needed = want.min(st.capacity) - st.tokens;
                Duration::from_secs_f64(needed / st.rate as f64)
                    .clamp(Duration::from_millis(1), MAX_SLEEP)
            };
            tokio::time::sleep(wait).await;
        }

        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Take as many of `bytes` as currently fit; never blocks.
    ///
    /// Returns the granted prefix length. Unlimited limiters grant
    /// everything.
    pub async fn try_take(&self, bytes: usize) -> usize {
        let granted = {
            let mut st = self.state.lock().await;
            if st.rate == 0 {
                bytes
            } else {
                st.refill();
                let granted = (st.tokens.max(0.0) as usize).min(bytes);
                st.tokens -= granted as f64;
                granted
            }
        };
        if granted > 0 {
            self.total_bytes.fetch_add(granted as u64, Ordering::Relaxed);
        }
        granted
    }

    /// Replace the configured rate. Zero disables limiting.
    pub async fn set_rate(&self, rate: u64) {
        let mut st = self.state.lock().await;
        st.configured_max = rate;
        st.apply_rate(rate);
        st.last_refill = Instant::now();
        self.rate_hint.store(rate, Ordering::Relaxed);
    }

    /// Refill the bucket to capacity and restart the refill clock.
    pub async fn reset(&self) {
        let mut st = self.state.lock().await;
        st.tokens = st.capacity;
        st.last_refill = Instant::now();
    }

    /// Cumulative bytes/wait accounting.
    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }

    /// Feed an RTT sample into the congestion controller.
    ///
    /// No-op unless the limiter was built with congestion control. Rate
    /// adjustments happen at most every 100 ms.
    pub async fn update_rtt(&self, rtt_ms: f64) {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.rate == 0 {
            return;
        }
        let Some(cong) = st.congestion.as_mut() else {
            return;
        };

        cong.rtt_history.push_back(rtt_ms);
        if cong.rtt_history.len() > RTT_HISTORY_SIZE {
            cong.rtt_history.pop_front();
        }
        cong.current_rtt = rtt_ms;

        // min RTT: adopt lower minima immediately, drift upward slowly
        // (1% per sample) when the window minimum sits >10% above.
        if cong.min_rtt >= 1000.0 {
            cong.min_rtt = rtt_ms;
        } else {
            let window_min = cong
                .rtt_history
                .iter()
                .copied()
                .fold(rtt_ms, f64::min);
            if window_min < cong.min_rtt {
                cong.min_rtt = window_min;
            } else if window_min > cong.min_rtt * 1.1 {
                cong.min_rtt *= 1.01;
            }
        }

        cong.queue_delay = (cong.current_rtt - cong.min_rtt).max(0.0);

        if cong.last_adjustment.elapsed() < ADJUST_INTERVAL {
            return;
        }
        cong.last_adjustment = Instant::now();

        let off_target = cong.target_delay - cong.queue_delay;
        let adjustment = GAIN * off_target * st.rate as f64 / cong.target_delay;
        let mut new_rate = (st.rate as f64 + adjustment).max(0.0) as u64;

        new_rate = new_rate.clamp(MIN_RATE, st.configured_max);
        let ceiling = (st.rate as f64 * MAX_RATE_INCREASE) as u64;
        if new_rate > ceiling {
            new_rate = ceiling;
        }

        if new_rate != st.rate {
            let (rtt, queue) = (cong.current_rtt, cong.queue_delay);
            st.apply_rate(new_rate);
            self.rate_hint.store(new_rate, Ordering::Relaxed);
            debug!(
                rate = new_rate,
                rtt_ms = rtt,
                queue_delay_ms = queue,
                "adjusted send rate"
            );
        }
    }

    /// Report packet loss; any loss halves the rate.
    pub async fn report_packet_loss(&self, packets_lost: u64, total_packets: u64) {
        if total_packets == 0 {
            return;
        }
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let Some(cong) = st.congestion.as_mut() else {
            return;
        };
        cong.packets_lost += packets_lost;
        cong.packets_sent += total_packets;

        if packets_lost > 0 && st.rate > 0 {
            let new_rate = ((st.rate as f64 * DECREASE_FACTOR) as u64).max(MIN_RATE);
            st.apply_rate(new_rate);
            self.rate_hint.store(new_rate, Ordering::Relaxed);
            debug!(rate = new_rate, "packet loss, rate halved");
        }
    }

    /// Congestion snapshot; `None` when congestion control is disabled.
    pub async fn congestion_stats(&self) -> Option<CongestionStats> {
        let st = self.state.lock().await;
        let cong = st.congestion.as_ref()?;
        Some(CongestionStats {
            current_rtt_ms: cong.current_rtt,
            min_rtt_ms: cong.min_rtt,
            queue_delay_ms: cong.queue_delay,
            target_delay_ms: cong.target_delay,
            current_rate: st.rate,
            packets_lost: cong.packets_lost,
            packets_sent: cong.packets_sent,
            loss_rate: if cong.packets_sent > 0 {
                cong.packets_lost as f64 / cong.packets_sent as f64
            } else {
                0.0
            },
        })
    }

    #[cfg(test)]
    async fn force_adjust_window(&self) {
        let mut st = self.state.lock().await;
        if let Some(cong) = st.congestion.as_mut() {
            cong.last_adjustment = Instant::now() - ADJUST_INTERVAL * 2;
        }
    }
}

/// Aggregate bandwidth statistics across a manager.
#[derive(Debug, Clone, Default)]
pub struct BandwidthStats {
    /// Global upload limit in bytes per second (0 = unlimited)
    pub global_upload_limit: u64,
    /// Global download limit in bytes per second (0 = unlimited)
    pub global_download_limit: u64,
    /// Total bytes admitted upward
    pub total_uploaded: u64,
    /// Total bytes admitted downward
    pub total_downloaded: u64,
    /// Cumulative upload wait milliseconds
    pub upload_wait_ms: u64,
    /// Cumulative download wait milliseconds
    pub download_wait_ms: u64,
    /// Number of peers with dedicated limiters
    pub active_peers: usize,
}

/// Two global limiters plus per-peer limiters for both directions.
///
/// `request_upload` consults the per-peer limiter first, then the global
/// one; both must grant before the caller proceeds.
pub struct BandwidthManager {
    global_upload: Arc<BandwidthLimiter>,
    global_download: Arc<BandwidthLimiter>,
    peer_upload: DashMap<String, Arc<BandwidthLimiter>>,
    peer_download: DashMap<String, Arc<BandwidthLimiter>>,
}

impl BandwidthManager {
    /// Create a manager with global limits (0 = unlimited).
    #[must_use]
    pub fn new(global_upload_bps: u64, global_download_bps: u64) -> Self {
        Self {
            global_upload: Arc::new(BandwidthLimiter::new(global_upload_bps)),
            global_download: Arc::new(BandwidthLimiter::new(global_download_bps)),
            peer_upload: DashMap::new(),
            peer_download: DashMap::new(),
        }
    }

    /// Admit `bytes` of upload traffic for `peer`.
    pub async fn request_upload(&self, peer: &str, bytes: usize) {
        if let Some(limiter) = self.peer_upload.get(peer).map(|l| l.clone()) {
            limiter.request(bytes).await;
        }
        self.global_upload.request(bytes).await;
    }

    /// Admit `bytes` of download traffic for `peer`.
    pub async fn request_download(&self, peer: &str, bytes: usize) {
        if let Some(limiter) = self.peer_download.get(peer).map(|l| l.clone()) {
            limiter.request(bytes).await;
        }
        self.global_download.request(bytes).await;
    }

    /// Replace the global upload limit.
    pub async fn set_global_upload_limit(&self, bytes_per_second: u64) {
        self.global_upload.set_rate(bytes_per_second).await;
        tracing::info!(rate = bytes_per_second, "global upload limit updated");
    }

    /// Replace the global download limit.
    pub async fn set_global_download_limit(&self, bytes_per_second: u64) {
        self.global_download.set_rate(bytes_per_second).await;
        tracing::info!(rate = bytes_per_second, "global download limit updated");
    }

    /// Install a dedicated upload limiter for `peer`.
    pub fn set_peer_upload_limit(&self, peer: &str, bytes_per_second: u64) {
        self.peer_upload
            .insert(peer.to_string(), Arc::new(BandwidthLimiter::new(bytes_per_second)));
    }

    /// Install a dedicated download limiter for `peer`.
    pub fn set_peer_download_limit(&self, peer: &str, bytes_per_second: u64) {
        self.peer_download
            .insert(peer.to_string(), Arc::new(BandwidthLimiter::new(bytes_per_second)));
    }

    /// Drop any per-peer limiters for `peer`.
    pub fn remove_peer(&self, peer: &str) {
        self.peer_upload.remove(peer);
        self.peer_download.remove(peer);
    }

    /// The global upload limiter (for congestion feedback).
    #[must_use]
    pub fn global_upload(&self) -> Arc<BandwidthLimiter> {
        self.global_upload.clone()
    }

    /// The global download limiter.
    #[must_use]
    pub fn global_download(&self) -> Arc<BandwidthLimiter> {
        self.global_download.clone()
    }

    /// Aggregate statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> BandwidthStats {
        let up = self.global_upload.stats();
        let down = self.global_download.stats();
        BandwidthStats {
            global_upload_limit: self.global_upload.rate(),
            global_download_limit: self.global_download.rate(),
            total_uploaded: up.total_bytes,
            total_downloaded: down.total_bytes,
            upload_wait_ms: up.total_wait_ms,
            download_wait_ms: down.total_wait_ms,
            active_peers: self.peer_upload.len(),
        }
    }
}
