use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::persistent::Protocol;

/// Observation hooks for the forwarding path. Every hook is fire-and-forget;
/// a sink must never influence how a query is handled.
pub trait MetricsSink: Send + Sync {
    /// One completed request against `upstream`. Called exactly once per
    /// successful `connect`.
    fn request(&self, upstream: SocketAddr, rcode: &str, duration: Duration);

    fn conn_cache_hit(&self, _upstream: SocketAddr, _proto: Protocol) {}

    fn conn_cache_miss(&self, _upstream: SocketAddr, _proto: Protocol) {}

    fn healthcheck_failure(&self, _upstream: SocketAddr) {}
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn request(&self, _upstream: SocketAddr, _rcode: &str, _duration: Duration) {}
}

// Upper bounds in milliseconds; the last bucket catches everything above.
const DURATION_BUCKETS_MS: [u64; 11] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500];

#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; DURATION_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, d: Duration) {
        let ms = d.as_millis() as u64;
        let idx = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(d.as_micros() as u64, Ordering::Relaxed);
    }

    fn avg_us(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            self.sum_us.load(Ordering::Relaxed) / count
        }
    }
}

type Counter<K> = DashMap<K, AtomicU64, FxBuildHasher>;

/// In-process counters: requests per upstream, rcodes per (rcode, upstream),
/// duration per (upstream, rcode), plus connection cache and health check
/// counters.
#[derive(Debug, Default)]
pub struct ForwardMetrics {
    requests: Counter<SocketAddr>,
    rcodes: Counter<(String, SocketAddr)>,
    durations: DashMap<(SocketAddr, String), DurationHistogram, FxBuildHasher>,
    cache_hits: Counter<(SocketAddr, Protocol)>,
    cache_misses: Counter<(SocketAddr, Protocol)>,
    hc_failures: Counter<SocketAddr>,
}

fn bump<K: std::hash::Hash + Eq>(map: &Counter<K>, key: K) {
    map.entry(key)
        .or_default()
        .fetch_add(1, Ordering::Relaxed);
}

fn read<K: std::hash::Hash + Eq>(map: &Counter<K>, key: &K) -> u64 {
    map.get(key).map_or(0, |v| v.load(Ordering::Relaxed))
}

impl ForwardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self, upstream: SocketAddr) -> u64 {
        read(&self.requests, &upstream)
    }

    #[cfg(test)]
    pub fn rcode_count(&self, rcode: &str, upstream: SocketAddr) -> u64 {
        read(&self.rcodes, &(rcode.to_string(), upstream))
    }

    #[cfg(test)]
    pub fn duration_count(&self, upstream: SocketAddr, rcode: &str) -> u64 {
        self.durations
            .get(&(upstream, rcode.to_string()))
            .map_or(0, |h| h.count.load(Ordering::Relaxed))
    }

    pub fn cache_hits(&self, upstream: SocketAddr, proto: Protocol) -> u64 {
        read(&self.cache_hits, &(upstream, proto))
    }

    pub fn cache_misses(&self, upstream: SocketAddr, proto: Protocol) -> u64 {
        read(&self.cache_misses, &(upstream, proto))
    }

    pub fn healthcheck_failures(&self, upstream: SocketAddr) -> u64 {
        read(&self.hc_failures, &upstream)
    }

    /// 单行文本快照，用于周期性日志
    pub fn snapshot(&self) -> String {
        let mut parts: Vec<String> = self
            .requests
            .iter()
            .map(|entry| {
                let upstream = *entry.key();
                let protos = [Protocol::Udp, Protocol::Tcp, Protocol::TcpTls];
                let hits: u64 = protos.iter().map(|p| self.cache_hits(upstream, *p)).sum();
                let misses: u64 = protos.iter().map(|p| self.cache_misses(upstream, *p)).sum();
                let avg_us = self
                    .durations
                    .iter()
                    .filter(|h| h.key().0 == upstream)
                    .map(|h| h.value().avg_us())
                    .max()
                    .unwrap_or(0);
                format!(
                    "upstream={} requests={} conn_cache_hits={} conn_cache_misses={} hc_failures={} max_avg_ms={:.3}",
                    upstream,
                    self.request_count(upstream),
                    hits,
                    misses,
                    self.healthcheck_failures(upstream),
                    avg_us as f64 / 1000.0
                )
            })
            .collect();
        parts.sort();
        parts.join("; ")
    }
}

impl MetricsSink for ForwardMetrics {
    fn request(&self, upstream: SocketAddr, rcode: &str, duration: Duration) {
        bump(&self.requests, upstream);
        bump(&self.rcodes, (rcode.to_string(), upstream));
        self.durations
            .entry((upstream, rcode.to_string()))
            .or_default()
            .observe(duration);
    }

    fn conn_cache_hit(&self, upstream: SocketAddr, proto: Protocol) {
        bump(&self.cache_hits, (upstream, proto));
    }

    fn conn_cache_miss(&self, upstream: SocketAddr, proto: Protocol) {
        bump(&self.cache_misses, (upstream, proto));
    }

    fn healthcheck_failure(&self, upstream: SocketAddr) {
        bump(&self.hc_failures, upstream);
    }
}
