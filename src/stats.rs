//! Process-wide traffic counters.
//!
//! Every session's processing path updates these concurrently, so each
//! counter is an independent atomic; `snapshot` never blocks traffic.
//! Counters are engine-owned state, created at start and dropped at stop.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of integers in the control-surface stats array.
pub const STATS_LEN: usize = 5;

#[derive(Debug, Default)]
pub struct TunnelStats {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    parse_drops: AtomicU64,
    connect_failures: AtomicU64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame was read from the TUN descriptor.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A frame was written to the TUN descriptor.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A malformed frame was dropped.
    pub fn record_parse_drop(&self) {
        self.parse_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// A SOCKS5 connection attempt failed.
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_sessions: u64) -> StatsSnapshot {
        StatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            parse_drops: self.parse_drops.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            active_sessions,
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub parse_drops: u64,
    pub connect_failures: u64,
    pub active_sessions: u64,
}

impl StatsSnapshot {
    /// Fixed ordering consumed by the control surface:
    /// `[rx_packets, tx_packets, rx_bytes, tx_bytes, active_sessions]`.
    /// Must stay stable across releases.
    pub fn to_array(&self) -> [u64; STATS_LEN] {
        [
            self.rx_packets,
            self.tx_packets,
            self.rx_bytes,
            self.tx_bytes,
            self.active_sessions,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TunnelStats::new();
        stats.record_rx(100);
        stats.record_rx(50);
        stats.record_tx(60);
        stats.record_parse_drop();

        let snap = stats.snapshot(3);
        assert_eq!(snap.rx_packets, 2);
        assert_eq!(snap.rx_bytes, 150);
        assert_eq!(snap.tx_packets, 1);
        assert_eq!(snap.tx_bytes, 60);
        assert_eq!(snap.parse_drops, 1);
        assert_eq!(snap.to_array(), [2, 1, 150, 60, 3]);
    }

    #[test]
    fn concurrent_updates_sum_exactly() {
        use std::sync::Arc;

        let stats = Arc::new(TunnelStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record_rx(10);
                    stats.record_tx(7);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot(0);
        assert_eq!(snap.rx_packets, 8000);
        assert_eq!(snap.rx_bytes, 80_000);
        assert_eq!(snap.tx_bytes, 56_000);
    }
}
