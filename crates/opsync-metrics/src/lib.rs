//! Counters, gauges, a bounded-ring latency histogram, and alert thresholds
//! (spec §2, §9). All updates are lock-free counters; histogram samples use
//! a bounded ring buffer so a busy engine never grows this module's memory
//! without limit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Sink the engine records into. A `dyn` trait object so `EngineDependencies`
/// (spec §9) can hold a fake in tests and a real sink in production.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, delta: u64);
    fn set_gauge(&self, name: &'static str, value: i64);
    fn record_latency_ms(&self, name: &'static str, value_ms: u64);
}

const HISTOGRAM_CAPACITY: usize = 1024;

struct RingHistogram {
    samples: Mutex<VecDeque<u64>>,
}

impl RingHistogram {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(HISTOGRAM_CAPACITY)),
        }
    }

    fn record(&self, value_ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == HISTOGRAM_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(value_ms);
    }

    /// Nearest-rank percentile over the current window. `p` in `[0, 100]`.
    fn percentile(&self, p: f64) -> Option<u64> {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    fn count(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}

/// Reference in-process sink: atomic counters/gauges keyed by name, plus one
/// bounded ring histogram per latency metric name.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, std::sync::Arc<AtomicU64>>>,
    gauges: Mutex<HashMap<&'static str, std::sync::Arc<AtomicI64>>>,
    histograms: Mutex<HashMap<&'static str, std::sync::Arc<RingHistogram>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str) -> i64 {
        self.gauges
            .lock()
            .unwrap()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn latency_p50_ms(&self, name: &'static str) -> Option<u64> {
        self.histograms.lock().unwrap().get(name).and_then(|h| h.percentile(50.0))
    }

    pub fn latency_p99_ms(&self, name: &'static str) -> Option<u64> {
        self.histograms.lock().unwrap().get(name).and_then(|h| h.percentile(99.0))
    }

    pub fn latency_sample_count(&self, name: &'static str) -> usize {
        self.histograms.lock().unwrap().get(name).map(|h| h.count()).unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &'static str, delta: u64) {
        let counter = self
            .counters
            .lock()
            .unwrap()
            .entry(name)
            .or_insert_with(|| std::sync::Arc::new(AtomicU64::new(0)))
            .clone();
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    fn set_gauge(&self, name: &'static str, value: i64) {
        let gauge = self
            .gauges
            .lock()
            .unwrap()
            .entry(name)
            .or_insert_with(|| std::sync::Arc::new(AtomicI64::new(0)))
            .clone();
        gauge.store(value, Ordering::Relaxed);
    }

    fn record_latency_ms(&self, name: &'static str, value_ms: u64) {
        let histogram = self
            .histograms
            .lock()
            .unwrap()
            .entry(name)
            .or_insert_with(|| std::sync::Arc::new(RingHistogram::new()))
            .clone();
        histogram.record(value_ms);
    }
}

/// Thresholds evaluated once per processing-loop iteration (spec §9
/// supplement: the distilled spec scopes metrics export out, but the engine
/// still needs an in-process signal for "something's wrong" independent of
/// any exporter).
#[derive(Debug, Clone, Copy)]
pub struct AlertThresholds {
    pub queue_depth_high: u64,
    pub failed_depth_high: u64,
    pub breaker_open_duration_high: ChronoDuration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_depth_high: 500,
            failed_depth_high: 50,
            breaker_open_duration_high: ChronoDuration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    QueueDepthHigh { depth: u64, threshold: u64 },
    FailedDepthHigh { depth: u64, threshold: u64 },
    BreakerOpenTooLong { since: DateTime<Utc>, threshold: ChronoDuration },
}

impl AlertThresholds {
    pub fn evaluate(
        &self,
        queue_depth: u64,
        failed_depth: u64,
        breaker_opened_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if queue_depth > self.queue_depth_high {
            alerts.push(Alert::QueueDepthHigh {
                depth: queue_depth,
                threshold: self.queue_depth_high,
            });
        }
        if failed_depth > self.failed_depth_high {
            alerts.push(Alert::FailedDepthHigh {
                depth: failed_depth,
                threshold: self.failed_depth_high,
            });
        }
        if let Some(opened_at) = breaker_opened_at {
            if now - opened_at > self.breaker_open_duration_high {
                alerts.push(Alert::BreakerOpenTooLong {
                    since: opened_at,
                    threshold: self.breaker_open_duration_high,
                });
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = InMemoryMetrics::new();
        m.incr_counter("ops_enqueued", 1);
        m.incr_counter("ops_enqueued", 2);
        assert_eq!(m.counter("ops_enqueued"), 3);
    }

    #[test]
    fn gauge_overwrites() {
        let m = InMemoryMetrics::new();
        m.set_gauge("queue_depth", 5);
        m.set_gauge("queue_depth", 2);
        assert_eq!(m.gauge("queue_depth"), 2);
    }

    #[test]
    fn histogram_ring_buffer_evicts_oldest() {
        let m = InMemoryMetrics::new();
        for i in 0..(HISTOGRAM_CAPACITY + 10) {
            m.record_latency_ms("send_ms", i as u64);
        }
        assert_eq!(m.latency_sample_count("send_ms"), HISTOGRAM_CAPACITY);
    }

    #[test]
    fn percentile_is_approximately_sane() {
        let m = InMemoryMetrics::new();
        for i in 1..=100u64 {
            m.record_latency_ms("send_ms", i);
        }
        assert_eq!(m.latency_p50_ms("send_ms"), Some(50));
        assert_eq!(m.latency_p99_ms("send_ms"), Some(99));
    }

    #[test]
    fn alert_thresholds_fire_when_exceeded() {
        let thresholds = AlertThresholds {
            queue_depth_high: 10,
            failed_depth_high: 5,
            breaker_open_duration_high: ChronoDuration::seconds(60),
        };
        let now = DateTime::UNIX_EPOCH + ChronoDuration::seconds(1000);
        let alerts = thresholds.evaluate(11, 6, Some(now - ChronoDuration::seconds(61)), now);
        assert_eq!(alerts.len(), 3);
    }

    #[test]
    fn alert_thresholds_silent_when_within_bounds() {
        let thresholds = AlertThresholds::default();
        let now = DateTime::UNIX_EPOCH;
        let alerts = thresholds.evaluate(1, 1, None, now);
        assert!(alerts.is_empty());
    }
}
