//! Traffic statistics: realtime counters and a 24-hour minute ring
//!
//! The realtime set is monotonically increasing since process start. The
//! history ring holds 1,440 one-minute buckets; writers and readers touch
//! only atomics, so the hot path never takes a lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::db::now_unix;

/// Minutes in 24 hours
pub const RING_SIZE: usize = 1440;

#[derive(Debug, Default)]
struct CounterSet {
    requests: AtomicU64,
    bytes: AtomicU64,
    status_2xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
}

impl CounterSet {
    fn record(&self, status: u16, bytes: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if (200..300).contains(&status) {
            self.status_2xx.fetch_add(1, Ordering::Relaxed);
        } else if (400..500).contains(&status) {
            self.status_4xx.fetch_add(1, Ordering::Relaxed);
        } else if status >= 500 {
            self.status_5xx.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn load(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.status_2xx.load(Ordering::Relaxed),
            self.status_4xx.load(Ordering::Relaxed),
            self.status_5xx.load(Ordering::Relaxed),
        )
    }

    /// Read and zero, for the per-minute store flush
    fn reset(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.requests.swap(0, Ordering::Relaxed),
            self.bytes.swap(0, Ordering::Relaxed),
            self.status_2xx.swap(0, Ordering::Relaxed),
            self.status_4xx.swap(0, Ordering::Relaxed),
            self.status_5xx.swap(0, Ordering::Relaxed),
        )
    }

    fn clear(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.status_2xx.store(0, Ordering::Relaxed);
        self.status_4xx.store(0, Ordering::Relaxed);
        self.status_5xx.store(0, Ordering::Relaxed);
    }
}

/// One history bucket; `minute` is the absolute UNIX minute it covers
struct MinuteBucket {
    minute: AtomicI64,
    counters: CounterSet,
}

impl MinuteBucket {
    fn new() -> Self {
        Self {
            minute: AtomicI64::new(-1),
            counters: CounterSet::default(),
        }
    }
}

/// Realtime counter snapshot served by the stats API
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RealtimeStats {
    pub requests: u64,
    pub bytes: u64,
    pub status_2xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub uptime_secs: u64,
}

/// One history sample (per-minute aggregate)
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HistorySample {
    pub ts: i64,
    pub requests: u64,
    pub bytes: u64,
    pub status_2xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
}

pub struct StatsCollector {
    realtime: CounterSet,
    /// Deltas since the last store flush
    pending_flush: CounterSet,
    ring: Vec<MinuteBucket>,
    /// L4 forwarder counters
    stream_connections: AtomicU64,
    stream_bytes: AtomicU64,
    start: Instant,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            realtime: CounterSet::default(),
            pending_flush: CounterSet::default(),
            ring: (0..RING_SIZE).map(|_| MinuteBucket::new()).collect(),
            stream_connections: AtomicU64::new(0),
            stream_bytes: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Record one completed response
    pub fn record(&self, status: u16, bytes: u64) {
        self.realtime.record(status, bytes);
        self.pending_flush.record(status, bytes);

        let minute = now_unix() / 60;
        let bucket = &self.ring[(minute as usize) % RING_SIZE];

        // Bucket recycled from 24 hours ago: claim it for this minute
        if bucket.minute.swap(minute, Ordering::Relaxed) != minute {
            bucket.counters.clear();
        }
        bucket.counters.record(status, bytes);
    }

    pub fn record_stream_connection(&self) {
        self.stream_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_bytes(&self, bytes: u64) {
        self.stream_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn realtime(&self) -> RealtimeStats {
        let (requests, bytes, status_2xx, status_4xx, status_5xx) = self.realtime.load();
        RealtimeStats {
            requests,
            bytes,
            status_2xx,
            status_4xx,
            status_5xx,
            uptime_secs: self.start.elapsed().as_secs(),
        }
    }

    /// History samples covering the last `hours` hours, oldest first
    pub fn history(&self, hours: u32) -> Vec<HistorySample> {
        let hours = hours.min(24).max(1);
        let now_minute = now_unix() / 60;
        let oldest = now_minute - (hours as i64) * 60 + 1;

        let mut samples = Vec::new();
        for minute in oldest..=now_minute {
            let bucket = &self.ring[(minute as usize) % RING_SIZE];
            if bucket.minute.load(Ordering::Relaxed) != minute {
                continue;
            }
            let (requests, bytes, status_2xx, status_4xx, status_5xx) = bucket.counters.load();
            samples.push(HistorySample {
                ts: minute * 60,
                requests,
                bytes,
                status_2xx,
                status_4xx,
                status_5xx,
            });
        }
        samples
    }

    /// Drain the deltas accumulated since the previous flush
    pub fn drain_pending(&self) -> (u64, u64, u64, u64, u64) {
        self.pending_flush.reset()
    }

    /// Export all counters in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use std::fmt::Write;

        let rt = self.realtime();
        let mut out = String::with_capacity(1024);

        out.push_str("# HELP routegate_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE routegate_uptime_seconds gauge\n");
        let _ = writeln!(out, "routegate_uptime_seconds {}", rt.uptime_secs);

        out.push_str("# HELP routegate_requests_total Proxied HTTP requests\n");
        out.push_str("# TYPE routegate_requests_total counter\n");
        let _ = writeln!(out, "routegate_requests_total {}", rt.requests);

        out.push_str("# HELP routegate_response_bytes_total Response body bytes sent to clients\n");
        out.push_str("# TYPE routegate_response_bytes_total counter\n");
        let _ = writeln!(out, "routegate_response_bytes_total {}", rt.bytes);

        out.push_str("# HELP routegate_responses_total Responses by status class\n");
        out.push_str("# TYPE routegate_responses_total counter\n");
        let _ = writeln!(
            out,
            "routegate_responses_total{{class=\"2xx\"}} {}",
            rt.status_2xx
        );
        let _ = writeln!(
            out,
            "routegate_responses_total{{class=\"4xx\"}} {}",
            rt.status_4xx
        );
        let _ = writeln!(
            out,
            "routegate_responses_total{{class=\"5xx\"}} {}",
            rt.status_5xx
        );

        out.push_str("# HELP routegate_stream_connections_total L4 stream connections accepted\n");
        out.push_str("# TYPE routegate_stream_connections_total counter\n");
        let _ = writeln!(
            out,
            "routegate_stream_connections_total {}",
            self.stream_connections.load(Ordering::Relaxed)
        );

        out.push_str("# HELP routegate_stream_bytes_total L4 stream bytes relayed\n");
        out.push_str("# TYPE routegate_stream_bytes_total counter\n");
        let _ = writeln!(
            out,
            "routegate_stream_bytes_total {}",
            self.stream_bytes.load(Ordering::Relaxed)
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_updates_buckets() {
        let stats = StatsCollector::new();

        stats.record(200, 100);
        stats.record(204, 50);
        stats.record(404, 10);
        stats.record(502, 0);

        let rt = stats.realtime();
        assert_eq!(rt.requests, 4);
        assert_eq!(rt.bytes, 160);
        assert_eq!(rt.status_2xx, 2);
        assert_eq!(rt.status_4xx, 1);
        assert_eq!(rt.status_5xx, 1);
    }

    #[test]
    fn test_redirects_count_as_neither_class() {
        let stats = StatsCollector::new();
        stats.record(301, 0);

        let rt = stats.realtime();
        assert_eq!(rt.requests, 1);
        assert_eq!(rt.status_2xx, 0);
        assert_eq!(rt.status_4xx, 0);
        assert_eq!(rt.status_5xx, 0);
    }

    #[test]
    fn test_history_contains_current_minute() {
        let stats = StatsCollector::new();
        stats.record(200, 42);

        let samples = stats.history(1);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].requests, 1);
        assert_eq!(samples[0].bytes, 42);
        assert_eq!(samples[0].ts % 60, 0);
    }

    #[test]
    fn test_drain_pending_resets() {
        let stats = StatsCollector::new();
        stats.record(200, 10);
        stats.record(500, 5);

        let (reqs, bytes, s2, _s4, s5) = stats.drain_pending();
        assert_eq!(reqs, 2);
        assert_eq!(bytes, 15);
        assert_eq!(s2, 1);
        assert_eq!(s5, 1);

        let (reqs, ..) = stats.drain_pending();
        assert_eq!(reqs, 0);

        // Realtime counters are unaffected by the flush
        assert_eq!(stats.realtime().requests, 2);
    }

    #[test]
    fn test_prometheus_export_shape() {
        let stats = StatsCollector::new();
        stats.record(200, 128);
        stats.record_stream_connection();
        stats.record_stream_bytes(2048);

        let text = stats.export_prometheus();
        assert!(text.contains("routegate_requests_total 1"));
        assert!(text.contains("routegate_response_bytes_total 128"));
        assert!(text.contains("routegate_responses_total{class=\"2xx\"} 1"));
        assert!(text.contains("routegate_stream_bytes_total 2048"));
    }
}
