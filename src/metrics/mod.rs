//! Prometheus-style metrics without the prometheus crate dependency.
//!
//! A small registry of hand-rolled atomic instruments rendered in the
//! text exposition format. The relay registers its own metric set at
//! startup and serves it at `GET /metrics`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use axum::http::header;
use axum::response::IntoResponse;
use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by an arbitrary amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge holding a signed integer that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Replace the current value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram with fixed upper bounds.
///
/// Observations land in the first bucket whose bound is not exceeded;
/// rendering accumulates them into the cumulative form Prometheus
/// expects. The sum is an f64 stored as bits and updated with a CAS
/// loop so concurrent observers never lose an addition.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let bucket_counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            bucket_counts,
            sum_bits: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record one observation.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        for (bound, bucket) in self.bounds.iter().zip(&self.bucket_counts) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Total number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observed values.
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    /// Cumulative count per configured bound, in bound order.
    fn cumulative_buckets(&self) -> Vec<u64> {
        let mut running = 0_u64;
        self.bucket_counts
            .iter()
            .map(|bucket| {
                running += bucket.load(Ordering::Relaxed);
                running
            })
            .collect()
    }
}

/// Counter family keyed by the value of a single label.
///
/// Reads take the shared lock; only the first increment for a new label
/// value takes the exclusive lock to insert the child counter.
#[derive(Debug)]
pub struct CounterVec {
    label: &'static str,
    children: RwLock<HashMap<String, Arc<Counter>>>,
}

impl CounterVec {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            children: RwLock::new(HashMap::new()),
        }
    }

    /// Increment the child counter for `value`, creating it on first use.
    pub fn inc(&self, value: &str) {
        if let Some(counter) = self.children.read().get(value) {
            counter.inc();
            return;
        }
        let counter = self
            .children
            .write()
            .entry(value.to_string())
            .or_default()
            .clone();
        counter.inc();
    }

    /// Current value for `value`, 0 if never incremented.
    pub fn get(&self, value: &str) -> u64 {
        self.children
            .read()
            .get(value)
            .map(|counter| counter.get())
            .unwrap_or(0)
    }

    /// Child values sorted by label value for stable rendering.
    fn snapshot(&self) -> Vec<(String, u64)> {
        let mut rows: Vec<(String, u64)> = self
            .children
            .read()
            .iter()
            .map(|(value, counter)| (value.clone(), counter.get()))
            .collect();
        rows.sort();
        rows
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Instrument {
    Counter(Arc<Counter>),
    CounterVec(Arc<CounterVec>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
}

impl Instrument {
    fn kind(&self) -> &'static str {
        match self {
            Instrument::Counter(_) | Instrument::CounterVec(_) => "counter",
            Instrument::Gauge(_) => "gauge",
            Instrument::Histogram(_) => "histogram",
        }
    }
}

#[derive(Debug)]
struct Descriptor {
    name: &'static str,
    help: &'static str,
    instrument: Instrument,
}

/// Holds every registered metric and renders them in registration order.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: RwLock<Vec<Descriptor>>,
}

impl MetricsRegistry {
    pub fn register_counter(&self, name: &'static str, help: &'static str) -> Arc<Counter> {
        let counter = Arc::new(Counter::default());
        self.push(name, help, Instrument::Counter(counter.clone()));
        counter
    }

    pub fn register_counter_vec(
        &self,
        name: &'static str,
        help: &'static str,
        label: &'static str,
    ) -> Arc<CounterVec> {
        let family = Arc::new(CounterVec::new(label));
        self.push(name, help, Instrument::CounterVec(family.clone()));
        family
    }

    pub fn register_gauge(&self, name: &'static str, help: &'static str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::default());
        self.push(name, help, Instrument::Gauge(gauge.clone()));
        gauge
    }

    pub fn register_histogram(
        &self,
        name: &'static str,
        help: &'static str,
        bounds: Vec<f64>,
    ) -> Arc<Histogram> {
        let histogram = Arc::new(Histogram::new(bounds));
        self.push(name, help, Instrument::Histogram(histogram.clone()));
        histogram
    }

    fn push(&self, name: &'static str, help: &'static str, instrument: Instrument) {
        self.metrics.write().push(Descriptor {
            name,
            help,
            instrument,
        });
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metrics = self.metrics.read();
        let mut out = String::new();
        for descriptor in metrics.iter() {
            let _ = writeln!(out, "# HELP {} {}", descriptor.name, descriptor.help);
            let _ = writeln!(
                out,
                "# TYPE {} {}",
                descriptor.name,
                descriptor.instrument.kind()
            );
            match &descriptor.instrument {
                Instrument::Counter(counter) => {
                    let _ = writeln!(out, "{} {}", descriptor.name, counter.get());
                }
                Instrument::CounterVec(family) => {
                    for (value, count) in family.snapshot() {
                        let _ = writeln!(
                            out,
                            "{}{{{}=\"{}\"}} {}",
                            descriptor.name,
                            family.label,
                            escape_label_value(&value),
                            count
                        );
                    }
                }
                Instrument::Gauge(gauge) => {
                    let _ = writeln!(out, "{} {}", descriptor.name, gauge.get());
                }
                Instrument::Histogram(histogram) => {
                    render_histogram(&mut out, descriptor.name, histogram);
                }
            }
        }
        out
    }
}

fn render_histogram(out: &mut String, name: &str, histogram: &Histogram) {
    let total = histogram.count();
    for (bound, cumulative) in histogram.bounds.iter().zip(histogram.cumulative_buckets()) {
        let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {total}");
    let _ = writeln!(out, "{name}_sum {}", histogram.sum());
    let _ = writeln!(out, "{name}_count {total}");
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// Relay metric set
// ---------------------------------------------------------------------------

static METRICS: LazyLock<MetricsRegistry> = LazyLock::new(MetricsRegistry::default);

/// Instruments covering the relay's own operations.
#[derive(Debug)]
pub struct RelayMetrics {
    /// Upload submissions by outcome (`accepted`, `timeout`, ...).
    pub submissions: Arc<CounterVec>,
    /// Processor callbacks by outcome (`stored`, `missing_session`, ...).
    pub callbacks: Arc<CounterVec>,
    /// Result polls by outcome (`hit`, `processing`).
    pub polls: Arc<CounterVec>,
    /// Wall-clock seconds spent forwarding one submission.
    pub forward_seconds: Arc<Histogram>,
    /// Results currently held by the store.
    pub stored_results: Arc<Gauge>,
}

pub static RELAY_METRICS: LazyLock<RelayMetrics> = LazyLock::new(|| RelayMetrics {
    submissions: METRICS.register_counter_vec(
        "quoterelay_submissions_total",
        "Upload submissions by forwarding outcome",
        "outcome",
    ),
    callbacks: METRICS.register_counter_vec(
        "quoterelay_callbacks_total",
        "Processor callbacks by outcome",
        "outcome",
    ),
    polls: METRICS.register_counter_vec(
        "quoterelay_polls_total",
        "Result polls by outcome",
        "outcome",
    ),
    forward_seconds: METRICS.register_histogram(
        "quoterelay_forward_seconds",
        "Seconds spent forwarding a submission to the processor",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0],
    ),
    stored_results: METRICS.register_gauge(
        "quoterelay_stored_results",
        "Analysis results currently stored",
    ),
});

/// Force creation of the relay metric set so every family is visible in
/// `/metrics` output from startup rather than from first use.
pub fn init_relay_metrics() {
    LazyLock::force(&RELAY_METRICS);
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// Serves the process-wide registry in text exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.render(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_zero() {
        let counter = Counter::default();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_counter_inc_and_inc_by() {
        let counter = Counter::default();
        counter.inc();
        counter.inc();
        counter.inc_by(3);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge_set_overwrites() {
        let gauge = Gauge::default();
        gauge.set(12);
        gauge.set(7);
        assert_eq!(gauge.get(), 7);
    }

    #[test]
    fn test_gauge_accepts_negative_values() {
        let gauge = Gauge::default();
        gauge.set(-3);
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_histogram_count_and_sum() {
        let histogram = Histogram::new(vec![1.0, 5.0, 10.0]);
        histogram.observe(0.5);
        histogram.observe(3.0);
        histogram.observe(7.0);
        histogram.observe(20.0);
        assert_eq!(histogram.count(), 4);
        assert!((histogram.sum() - 30.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_buckets_render_cumulatively() {
        let registry = MetricsRegistry::default();
        let histogram = registry.register_histogram("lat", "Latency", vec![1.0, 5.0]);
        histogram.observe(0.5);
        histogram.observe(0.7);
        histogram.observe(3.0);
        histogram.observe(9.0);

        let output = registry.render();
        assert!(output.contains("lat_bucket{le=\"1\"} 2"));
        assert!(output.contains("lat_bucket{le=\"5\"} 3"));
        assert!(output.contains("lat_bucket{le=\"+Inf\"} 4"));
        assert!(output.contains("lat_count 4"));
    }

    #[test]
    fn test_counter_vec_tracks_children_independently() {
        let family = CounterVec::new("outcome");
        family.inc("accepted");
        family.inc("accepted");
        family.inc("timeout");
        assert_eq!(family.get("accepted"), 2);
        assert_eq!(family.get("timeout"), 1);
        assert_eq!(family.get("rejected"), 0);
    }

    #[test]
    fn test_registry_renders_counter() {
        let registry = MetricsRegistry::default();
        let counter = registry.register_counter("requests_total", "Total requests");
        counter.inc_by(4);

        let output = registry.render();
        assert!(output.contains("# HELP requests_total Total requests"));
        assert!(output.contains("# TYPE requests_total counter"));
        assert!(output.contains("requests_total 4"));
    }

    #[test]
    fn test_registry_renders_counter_vec_sorted_by_label() {
        let registry = MetricsRegistry::default();
        let family = registry.register_counter_vec("polls_total", "Polls", "outcome");
        family.inc("processing");
        family.inc("hit");
        family.inc("hit");

        let output = registry.render();
        assert!(output.contains("# TYPE polls_total counter"));
        let hit = output.find("polls_total{outcome=\"hit\"} 2");
        let processing = output.find("polls_total{outcome=\"processing\"} 1");
        assert!(hit.is_some());
        assert!(processing.is_some());
        assert!(hit < processing);
    }

    #[test]
    fn test_registry_renders_gauge() {
        let registry = MetricsRegistry::default();
        let gauge = registry.register_gauge("stored", "Stored results");
        gauge.set(42);

        let output = registry.render();
        assert!(output.contains("# TYPE stored gauge"));
        assert!(output.contains("stored 42"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let registry = MetricsRegistry::default();
        let family = registry.register_counter_vec("odd_total", "Odd labels", "value");
        family.inc("with \"quotes\" and \\slash");

        let output = registry.render();
        assert!(output.contains("odd_total{value=\"with \\\"quotes\\\" and \\\\slash\"} 1"));
    }

    #[test]
    fn test_relay_metrics_registered_once() {
        init_relay_metrics();
        init_relay_metrics();
        RELAY_METRICS.polls.inc("hit");

        let output = METRICS.render();
        assert_eq!(output.matches("# TYPE quoterelay_polls_total").count(), 1);
        assert!(output.contains("quoterelay_polls_total{outcome=\"hit\"}"));
        assert!(output.contains("# TYPE quoterelay_forward_seconds histogram"));
        assert!(output.contains("# TYPE quoterelay_stored_results gauge"));
    }
}
