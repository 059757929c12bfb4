//! Traffic statistics collection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Live counters shared by the packet processor and observers.
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Sealed bytes handed to the channel
    pub bytes_sent: AtomicU64,
    /// Opened bytes handed to the channel
    pub bytes_received: AtomicU64,
    /// Packets sealed
    pub packets_sent: AtomicU64,
    /// Packets opened
    pub packets_received: AtomicU64,
    /// Packets that failed to seal
    pub encrypt_failures: AtomicU64,
    /// Packets that failed to open
    pub decrypt_failures: AtomicU64,
    /// Batches read from the channel
    pub batches: AtomicU64,
}

impl TunnelStats {
    /// Create new stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sealed packet.
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record an opened packet.
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a packet dropped while sealing.
    pub fn record_encrypt_failure(&self) {
        self.encrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet dropped while opening.
    pub fn record_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch read from the channel.
    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Total dropped packets.
    pub fn dropped(&self) -> u64 {
        self.encrypt_failures.load(Ordering::Relaxed)
            + self.decrypt_failures.load(Ordering::Relaxed)
    }
}

/// Point-in-time traffic metrics served to the host app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    /// Batches read from the channel
    #[serde(default)]
    pub batches: u64,
    /// Average upload rate since the session started running (bytes/s)
    pub upload_bps: f64,
    /// Average download rate since the session started running (bytes/s)
    pub download_bps: f64,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

impl TrafficMetrics {
    /// All-zero metrics (no session)
    pub fn zero() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            packets_dropped: 0,
            batches: 0,
            upload_bps: 0.0,
            download_bps: 0.0,
            timestamp: unix_now(),
        }
    }

    /// Snapshot `stats`, averaging rates over the time since `running_since`.
    pub fn snapshot(stats: &TunnelStats, running_since: Option<Instant>) -> Self {
        let bytes_sent = stats.bytes_sent.load(Ordering::Relaxed);
        let bytes_received = stats.bytes_received.load(Ordering::Relaxed);

        let elapsed = running_since
            .map(|t| t.elapsed().as_secs_f64())
            .filter(|secs| *secs > 0.0);
        let rate = |bytes: u64| elapsed.map(|secs| bytes as f64 / secs).unwrap_or(0.0);

        Self {
            bytes_sent,
            bytes_received,
            packets_sent: stats.packets_sent.load(Ordering::Relaxed),
            packets_received: stats.packets_received.load(Ordering::Relaxed),
            packets_dropped: stats.dropped(),
            batches: stats.batches.load(Ordering::Relaxed),
            upload_bps: rate(bytes_sent),
            download_bps: rate(bytes_received),
            timestamp: unix_now(),
        }
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), dropped: {}",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
            self.packets_dropped
        )
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stats_tracking() {
        let stats = TunnelStats::new();

        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(40);
        stats.record_decrypt_failure();
        stats.record_encrypt_failure();
        stats.record_batch();
        stats.record_batch();

        let metrics = TrafficMetrics::snapshot(&stats, None);
        assert_eq!(metrics.bytes_sent, 150);
        assert_eq!(metrics.packets_sent, 2);
        assert_eq!(metrics.bytes_received, 40);
        assert_eq!(metrics.packets_received, 1);
        assert_eq!(metrics.packets_dropped, 2);
        assert_eq!(metrics.batches, 2);
        assert_eq!(metrics.upload_bps, 0.0);
    }

    #[test]
    fn test_rates_use_running_time() {
        let stats = TunnelStats::new();
        stats.record_sent(1000);

        let since = Instant::now() - Duration::from_secs(10);
        let metrics = TrafficMetrics::snapshot(&stats, Some(since));

        assert!(metrics.upload_bps > 0.0);
        assert!(metrics.upload_bps <= 100.0);
        assert_eq!(metrics.download_bps, 0.0);
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(TrafficMetrics::zero()).unwrap();

        assert!(json.get("bytesSent").is_some());
        assert!(json.get("packetsDropped").is_some());
        assert!(json.get("uploadBps").is_some());
    }
}
