//! Internal statistics for the listener and worker pipeline.
//!
//! The embedding process periodically snapshots these and forwards them to
//! its own telemetry sink; the service just keeps the atomics current.

use std::sync::atomic::{AtomicU64, Ordering};

/// Listener self-stats. Gauges are `store`d, counters accumulate.
#[derive(Debug, Default)]
pub struct SourceStats {
    tcp_max_connections: AtomicU64,
    tcp_current_connections: AtomicU64,
    tcp_total_connections: AtomicU64,
    tcp_packets_received: AtomicU64,
    tcp_bytes_received: AtomicU64,
    udp_packets_received: AtomicU64,
    udp_packets_dropped: AtomicU64,
    udp_bytes_received: AtomicU64,
    parse_time_ns: AtomicU64,
    pending_messages: AtomicU64,
    max_pending_messages: AtomicU64,
}

/// Point-in-time copy of [`SourceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tcp_max_connections: u64,
    pub tcp_current_connections: u64,
    pub tcp_total_connections: u64,
    pub tcp_packets_received: u64,
    pub tcp_bytes_received: u64,
    pub udp_packets_received: u64,
    pub udp_packets_dropped: u64,
    pub udp_bytes_received: u64,
    pub parse_time_ns: u64,
    pub pending_messages: u64,
    pub max_pending_messages: u64,
}

impl SourceStats {
    /// Records the configured ceilings once at startup.
    pub fn set_limits(&self, max_tcp_connections: u64, max_pending_messages: u64) {
        self.tcp_max_connections
            .store(max_tcp_connections, Ordering::Relaxed);
        self.max_pending_messages
            .store(max_pending_messages, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.tcp_current_connections.fetch_add(1, Ordering::Relaxed);
        self.tcp_total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.tcp_current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_tcp_packet(&self, bytes: u64) {
        self.tcp_packets_received.fetch_add(1, Ordering::Relaxed);
        self.tcp_bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_udp_packet(&self, bytes: u64) {
        self.udp_packets_received.fetch_add(1, Ordering::Relaxed);
        self.udp_bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_udp_drop(&self) {
        self.udp_packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending_messages(&self, pending: u64) {
        self.pending_messages.store(pending, Ordering::Relaxed);
    }

    pub fn set_parse_time(&self, nanos: u64) {
        self.parse_time_ns.store(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tcp_max_connections: self.tcp_max_connections.load(Ordering::Relaxed),
            tcp_current_connections: self.tcp_current_connections.load(Ordering::Relaxed),
            tcp_total_connections: self.tcp_total_connections.load(Ordering::Relaxed),
            tcp_packets_received: self.tcp_packets_received.load(Ordering::Relaxed),
            tcp_bytes_received: self.tcp_bytes_received.load(Ordering::Relaxed),
            udp_packets_received: self.udp_packets_received.load(Ordering::Relaxed),
            udp_packets_dropped: self.udp_packets_dropped.load(Ordering::Relaxed),
            udp_bytes_received: self.udp_bytes_received.load(Ordering::Relaxed),
            parse_time_ns: self.parse_time_ns.load(Ordering::Relaxed),
            pending_messages: self.pending_messages.load(Ordering::Relaxed),
            max_pending_messages: self.max_pending_messages.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let stats = SourceStats::default();
        stats.set_limits(250, 10_000);
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.record_tcp_packet(11);
        stats.record_udp_packet(64);
        stats.record_udp_packet(16);
        stats.record_udp_drop();
        stats.set_pending_messages(7);
        stats.set_parse_time(12_345);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tcp_max_connections, 250);
        assert_eq!(snapshot.max_pending_messages, 10_000);
        assert_eq!(snapshot.tcp_current_connections, 1);
        assert_eq!(snapshot.tcp_total_connections, 2);
        assert_eq!(snapshot.tcp_packets_received, 1);
        assert_eq!(snapshot.tcp_bytes_received, 11);
        assert_eq!(snapshot.udp_packets_received, 2);
        assert_eq!(snapshot.udp_bytes_received, 80);
        assert_eq!(snapshot.udp_packets_dropped, 1);
        assert_eq!(snapshot.pending_messages, 7);
        assert_eq!(snapshot.parse_time_ns, 12_345);
    }
}
