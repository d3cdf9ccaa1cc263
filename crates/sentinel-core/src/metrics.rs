//! Daemon metrics: atomic counters, EWMA gauges, active transfers.
//!
//! Counters are updated lock-free from any task; snapshots are plain
//! values. The Prometheus-style text export serialises everything the
//! collector knows; scrape formatting is best-effort and not part of the
//! sync core's correctness surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Smoothing factor for the gauges.
const GAUGE_ALPHA: f64 = 0.2;

/// An exponentially-weighted moving average stored as atomic bits.
#[derive(Debug, Default)]
pub struct EwmaGauge {
    bits: AtomicU64,
    seeded: std::sync::atomic::AtomicBool,
}

impl EwmaGauge {
    /// Feed a sample.
    pub fn record(&self, value: f64) {
        if !self.seeded.swap(true, Ordering::AcqRel) {
            self.bits.store(value.to_bits(), Ordering::Release);
            return;
        }
        // CAS loop keeps concurrent updates coherent.
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let old = f64::from_bits(current);
            let new = GAUGE_ALPHA * value + (1.0 - GAUGE_ALPHA) * old;
            match self.bits.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current smoothed value (0.0 before the first sample).
    #[must_use]
    pub fn get(&self) -> f64 {
        if self.seeded.load(Ordering::Acquire) {
            f64::from_bits(self.bits.load(Ordering::Acquire))
        } else {
            0.0
        }
    }
}

/// One in-flight transfer.
#[derive(Debug, Clone)]
pub struct ActiveTransfer {
    /// Counterpart peer
    pub peer_id: String,
    /// File path being moved
    pub path: String,
    /// Total bytes expected
    pub total_bytes: u64,
    /// Bytes moved so far
    pub transferred: u64,
    /// When the transfer started
    pub started_at: Instant,
}

/// The daemon metrics collector.
#[derive(Default)]
pub struct Metrics {
    /// Payload bytes sent on any transport
    pub bytes_sent: AtomicU64,
    /// Payload bytes received on any transport
    pub bytes_received: AtomicU64,
    /// Application messages sent
    pub messages_sent: AtomicU64,
    /// Application messages received (after decrypt)
    pub messages_received: AtomicU64,
    /// Files whose updates reached at least one peer
    pub files_synced: AtomicU64,
    /// Peer connections established
    pub connections: AtomicU64,
    /// Peer disconnections
    pub disconnections: AtomicU64,
    /// Broadcast or storage failures in the sync path
    pub sync_errors: AtomicU64,
    /// Envelope sealing failures
    pub encryption_errors: AtomicU64,
    /// Envelopes dropped for failed authentication
    pub auth_failures: AtomicU64,
    /// Envelopes dropped by replay protection
    pub replay_drops: AtomicU64,
    /// Carrier-level errors (oversize frames, stream failures)
    pub transport_errors: AtomicU64,

    /// Smoothed sync round latency in milliseconds
    pub sync_latency_ms: EwmaGauge,
    /// Smoothed transfer speed in bytes per second
    pub transfer_speed_bps: EwmaGauge,

    transfers: std::sync::Mutex<HashMap<String, ActiveTransfer>>,
}

/// Plain-value snapshot of every counter and gauge.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Files synced
    pub files_synced: u64,
    /// Connections established
    pub connections: u64,
    /// Disconnections observed
    pub disconnections: u64,
    /// Sync-path errors
    pub sync_errors: u64,
    /// Sealing failures
    pub encryption_errors: u64,
    /// Authentication drops
    pub auth_failures: u64,
    /// Replay drops
    pub replay_drops: u64,
    /// Carrier errors
    pub transport_errors: u64,
    /// Smoothed sync latency (ms)
    pub sync_latency_ms: f64,
    /// Smoothed transfer speed (bytes/s)
    pub transfer_speed_bps: f64,
    /// In-flight transfer count
    pub active_transfers: usize,
}

impl Metrics {
    /// Create a zeroed collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record payload bytes going out.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record payload bytes coming in.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Begin tracking a transfer under `transfer_id`.
    pub fn begin_transfer(&self, transfer_id: &str, peer_id: &str, path: &str, total_bytes: u64) {
        self.transfers.lock().unwrap().insert(
            transfer_id.to_string(),
            ActiveTransfer {
                peer_id: peer_id.to_string(),
                path: path.to_string(),
                total_bytes,
                transferred: 0,
                started_at: Instant::now(),
            },
        );
    }

    /// Update progress on a tracked transfer and feed the speed gauge.
    pub fn update_transfer(&self, transfer_id: &str, transferred: u64) {
        let mut transfers = self.transfers.lock().unwrap();
        if let Some(transfer) = transfers.get_mut(transfer_id) {
            transfer.transferred = transferred;
            let elapsed = transfer.started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.transfer_speed_bps.record(transferred as f64 / elapsed);
            }
        }
    }

    /// Stop tracking a transfer.
    pub fn end_transfer(&self, transfer_id: &str) -> Option<ActiveTransfer> {
        self.transfers.lock().unwrap().remove(transfer_id)
    }

    /// All in-flight transfers.
    #[must_use]
    pub fn active_transfers(&self) -> Vec<ActiveTransfer> {
        self.transfers.lock().unwrap().values().cloned().collect()
    }

    /// Value-typed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            files_synced: self.files_synced.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            disconnections: self.disconnections.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
            encryption_errors: self.encryption_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            replay_drops: self.replay_drops.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            sync_latency_ms: self.sync_latency_ms.get(),
            transfer_speed_bps: self.transfer_speed_bps.get(),
            active_transfers: self.transfers.lock().unwrap().len(),
        }
    }

    /// Prometheus-style text exposition of every counter and gauge.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let counters = [
            ("sentinelfs_bytes_sent_total", s.bytes_sent),
            ("sentinelfs_bytes_received_total", s.bytes_received),
            ("sentinelfs_messages_sent_total", s.messages_sent),
            ("sentinelfs_messages_received_total", s.messages_received),
            ("sentinelfs_files_synced_total", s.files_synced),
            ("sentinelfs_connections_total", s.connections),
            ("sentinelfs_disconnections_total", s.disconnections),
            ("sentinelfs_sync_errors_total", s.sync_errors),
            ("sentinelfs_encryption_errors_total", s.encryption_errors),
            ("sentinelfs_auth_failures_total", s.auth_failures),
            ("sentinelfs_replay_drops_total", s.replay_drops),
            ("sentinelfs_transport_errors_total", s.transport_errors),
        ];
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }

        let gauges = [
            ("sentinelfs_sync_latency_ms", s.sync_latency_ms),
            ("sentinelfs_transfer_speed_bps", s.transfer_speed_bps),
            (
                "sentinelfs_active_transfers",
                s.active_transfers as f64,
            ),
        ];
        for (name, value) in gauges {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.add_bytes_sent(100);
        m.add_bytes_sent(50);
        m.add_bytes_received(30);
        m.connections.fetch_add(2, Ordering::Relaxed);

        let s = m.snapshot();
        assert_eq!(s.bytes_sent, 150);
        assert_eq!(s.bytes_received, 30);
        assert_eq!(s.connections, 2);
        assert_eq!(s.sync_errors, 0);
    }

    #[test]
    fn test_ewma_gauge_seeds_then_smooths() {
        let gauge = EwmaGauge::default();
        assert_eq!(gauge.get(), 0.0);

        gauge.record(100.0);
        assert!((gauge.get() - 100.0).abs() < 1e-9);

        gauge.record(200.0);
        // 0.2 * 200 + 0.8 * 100 = 120
        assert!((gauge.get() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_transfer_lifecycle() {
        let m = Metrics::new();
        m.begin_transfer("t1", "peer-a", "/data/file.bin", 1_000);
        assert_eq!(m.active_transfers().len(), 1);

        m.update_transfer("t1", 500);
        let transfers = m.active_transfers();
        assert_eq!(transfers[0].transferred, 500);

        let done = m.end_transfer("t1").unwrap();
        assert_eq!(done.peer_id, "peer-a");
        assert!(m.active_transfers().is_empty());
        assert!(m.end_transfer("t1").is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let m = Metrics::new();
        m.add_bytes_sent(10);
        let snap = m.snapshot();
        m.add_bytes_sent(10);
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(m.snapshot().bytes_sent, 20);
    }

    #[test]
    fn test_prometheus_export_lists_everything() {
        let m = Metrics::new();
        m.add_bytes_sent(42);
        m.files_synced.fetch_add(3, Ordering::Relaxed);
        m.sync_latency_ms.record(12.5);

        let text = m.to_prometheus();
        assert!(text.contains("sentinelfs_bytes_sent_total 42"));
        assert!(text.contains("sentinelfs_files_synced_total 3"));
        assert!(text.contains("sentinelfs_sync_latency_ms 12.5"));
        assert!(text.contains("# TYPE sentinelfs_bytes_sent_total counter"));
        assert!(text.contains("# TYPE sentinelfs_active_transfers gauge"));
    }

    #[test]
    fn test_gauge_concurrent_updates() {
        let m = std::sync::Arc::new(Metrics::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.sync_latency_ms.record(50.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Converges to the constant input.
        assert!((m.sync_latency_ms.get() - 50.0).abs() < 1.0);
    }
}
