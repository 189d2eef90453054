//! Pipeline metrics with Prometheus text export

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rejection reasons tracked separately
pub const REJECTION_REASONS: &[&str] =
    &["origin", "rate_limit", "csrf", "auth", "validation", "internal"];

/// Point-in-time snapshot
#[derive(Debug, Clone)]
pub struct SecuritySnapshot {
    /// Total requests seen by the pipeline
    pub total_requests: u64,

    /// Requests forwarded to a handler
    pub forwarded: u64,

    /// Preflights answered directly
    pub preflights: u64,

    /// Rejections, in `REJECTION_REASONS` order
    pub rejections: Vec<(&'static str, u64)>,

    /// Average pipeline time (ms)
    pub avg_response_time_ms: f64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl SecuritySnapshot {
    pub fn rejections_for(&self, reason: &str) -> u64 {
        self.rejections
            .iter()
            .find(|(r, _)| *r == reason)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total_rejections(&self) -> u64 {
        self.rejections.iter().map(|(_, n)| n).sum()
    }
}

/// Latency histogram buckets (in milliseconds)
const LATENCY_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Histogram for tracking latency distribution
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<(f64, Arc<AtomicU64>)>,
    sum: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
}

impl Histogram {
    fn new(buckets: &[f64]) -> Self {
        let bucket_counters = buckets
            .iter()
            .map(|&b| (b, Arc::new(AtomicU64::new(0))))
            .collect();

        Self {
            buckets: bucket_counters,
            sum: Arc::new(AtomicU64::new(0)),
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    fn observe(&self, value: f64) {
        self.sum.fetch_add(value as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        // Cumulative: every bucket at or above the value
        for (bucket, counter) in &self.buckets {
            if value <= *bucket {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn export_prometheus(&self, name: &str, help: &str) -> String {
        let mut output = String::new();

        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} histogram\n", name));

        for (bucket, counter) in &self.buckets {
            let count = counter.load(Ordering::Relaxed);
            output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, bucket, count));
        }

        let total_count = self.count.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, total_count));

        let sum = self.sum.load(Ordering::Relaxed) as f64;
        output.push_str(&format!("{}_sum {:.3}\n", name, sum));
        output.push_str(&format!("{}_count {}\n", name, total_count));

        output
    }
}

/// Counters for the security pipeline
pub struct SecurityMetrics {
    start_time: Instant,
    total_requests: AtomicU64,
    forwarded: AtomicU64,
    preflights: AtomicU64,
    rejections: Vec<AtomicU64>,
    total_response_time_ms: AtomicU64,
    request_latency: Histogram,
}

impl SecurityMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            preflights: AtomicU64::new(0),
            rejections: REJECTION_REASONS.iter().map(|_| AtomicU64::new(0)).collect(),
            total_response_time_ms: AtomicU64::new(0),
            request_latency: Histogram::new(LATENCY_BUCKETS),
        }
    }

    /// Record time spent on one request
    pub fn record_request(&self, response_time: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let ms = response_time.as_millis() as u64;
        self.total_response_time_ms.fetch_add(ms, Ordering::Relaxed);
        self.request_latency.observe(ms as f64);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preflight(&self) {
        self.preflights.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejection; unknown reasons count as `internal`
    pub fn record_rejection(&self, reason: &str) {
        let idx = REJECTION_REASONS
            .iter()
            .position(|r| *r == reason)
            .unwrap_or(REJECTION_REASONS.len() - 1);
        self.rejections[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SecuritySnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_response_time = self.total_response_time_ms.load(Ordering::Relaxed);

        let avg_response_time_ms = if total_requests > 0 {
            total_response_time as f64 / total_requests as f64
        } else {
            0.0
        };

        SecuritySnapshot {
            total_requests,
            forwarded: self.forwarded.load(Ordering::Relaxed),
            preflights: self.preflights.load(Ordering::Relaxed),
            rejections: REJECTION_REASONS
                .iter()
                .zip(&self.rejections)
                .map(|(reason, n)| (*reason, n.load(Ordering::Relaxed)))
                .collect(),
            avg_response_time_ms,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let snapshot = self.snapshot();

        let mut output = format!(
            "# HELP gym_gateway_requests_total Total number of requests\n\
             # TYPE gym_gateway_requests_total counter\n\
             gym_gateway_requests_total {}\n\
             \n\
             # HELP gym_gateway_forwarded_total Requests forwarded to handlers\n\
             # TYPE gym_gateway_forwarded_total counter\n\
             gym_gateway_forwarded_total {}\n\
             \n\
             # HELP gym_gateway_preflights_total CORS preflights answered\n\
             # TYPE gym_gateway_preflights_total counter\n\
             gym_gateway_preflights_total {}\n\
             \n\
             # HELP gym_gateway_avg_response_time_ms Average pipeline time in milliseconds\n\
             # TYPE gym_gateway_avg_response_time_ms gauge\n\
             gym_gateway_avg_response_time_ms {:.2}\n\
             \n\
             # HELP gym_gateway_uptime_seconds Uptime in seconds\n\
             # TYPE gym_gateway_uptime_seconds counter\n\
             gym_gateway_uptime_seconds {}\n\
             \n\
             # HELP gym_gateway_rejections_total Requests rejected by the pipeline\n\
             # TYPE gym_gateway_rejections_total counter\n",
            snapshot.total_requests,
            snapshot.forwarded,
            snapshot.preflights,
            snapshot.avg_response_time_ms,
            snapshot.uptime_secs,
        );

        for (reason, count) in &snapshot.rejections {
            output.push_str(&format!(
                "gym_gateway_rejections_total{{reason=\"{}\"}} {}\n",
                reason, count
            ));
        }
        output.push('\n');

        output.push_str(&self.request_latency.export_prometheus(
            "gym_gateway_request_duration_ms",
            "Request duration in milliseconds",
        ));

        output
    }
}

impl Default for SecurityMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_metrics() {
        let metrics = SecurityMetrics::new();

        metrics.record_request(Duration::from_millis(100));
        metrics.record_request(Duration::from_millis(200));
        metrics.record_forwarded();
        metrics.record_rejection("csrf");
        metrics.record_rejection("no-such-reason");

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.avg_response_time_ms, 150.0);
        assert_eq!(snapshot.rejections_for("csrf"), 1);
        assert_eq!(snapshot.rejections_for("internal"), 1);
        assert_eq!(snapshot.total_rejections(), 2);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = SecurityMetrics::new();
        metrics.record_request(Duration::from_millis(100));
        metrics.record_rejection("rate_limit");

        let prometheus = metrics.export_prometheus();

        assert!(prometheus.contains("gym_gateway_requests_total 1"));
        assert!(prometheus.contains("gym_gateway_avg_response_time_ms 100.00"));
        assert!(prometheus.contains("gym_gateway_rejections_total{reason=\"rate_limit\"} 1"));
        assert!(prometheus.contains("gym_gateway_request_duration_ms_bucket{le=\"100\"} 1"));
    }
}
