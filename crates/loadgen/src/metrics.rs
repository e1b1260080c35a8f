//! Metrics collection and statistics.
//!
//! Workers push [`Sample`]s into a shared [`MetricCollector`]. State is split
//! across independently locked shards so concurrent virtual users rarely contend,
//! and each lock is held only for the in-memory update. At run end the collector
//! is frozen and [`MetricCollector::snapshot`] merges the shards into one
//! [`MetricSnapshot`].
//!
//! Trend metrics keep exact count, sum, min and max. Percentiles come from an HDR
//! histogram with 3 significant digits over microsecond-resolution values, so a
//! reported percentile is within 0.1% of the true sample value (and is clamped to
//! the exact min/max).

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::MetricError;

/// Names of the metrics recorded by the engine itself.
pub mod names {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const CHECKS: &str = "checks";
    pub const ERRORS: &str = "errors";
    pub const VUS: &str = "vus";

    /// Per-step request duration, e.g. `http_req_duration{step:ping}`.
    pub fn step_duration(step: &str) -> String {
        format!("{}{{step:{}}}", HTTP_REQ_DURATION, step)
    }

    /// Per-check outcome rate, e.g. `checks{check:ping status is 200}`.
    pub fn check(check: &str) -> String {
        format!("{}{{check:{}}}", CHECKS, check)
    }
}

/// HDR histogram precision.
const SIGNIFICANT_DIGITS: u8 = 3;

/// Trend values are milliseconds; the histogram stores microseconds.
const HISTOGRAM_SCALE: f64 = 1000.0;

/// What a metric measures, fixed by its first sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Distribution of numeric values (usually milliseconds).
    Trend,
    /// Fraction of true outcomes.
    Rate,
    /// Monotonic sum of increments.
    Counter,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Trend => "trend",
            MetricKind::Rate => "rate",
            MetricKind::Counter => "counter",
        };
        f.write_str(s)
    }
}

/// Recorded value of a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    Trend(f64),
    Rate(bool),
    Counter(f64),
}

impl SampleValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            SampleValue::Trend(_) => MetricKind::Trend,
            SampleValue::Rate(_) => MetricKind::Rate,
            SampleValue::Counter(_) => MetricKind::Counter,
        }
    }
}

/// One measurement attributed to a named metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: String,
    pub value: SampleValue,
    pub timestamp: Instant,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: SampleValue) -> Self {
        Self {
            metric: metric.into(),
            value,
            timestamp: Instant::now(),
        }
    }

    pub fn trend(metric: impl Into<String>, value: f64) -> Self {
        Self::new(metric, SampleValue::Trend(value))
    }

    pub fn rate(metric: impl Into<String>, outcome: bool) -> Self {
        Self::new(metric, SampleValue::Rate(outcome))
    }

    pub fn counter(metric: impl Into<String>, increment: f64) -> Self {
        Self::new(metric, SampleValue::Counter(increment))
    }

    /// Trend sample from a duration, in milliseconds.
    pub fn duration(metric: impl Into<String>, duration: Duration) -> Self {
        Self::trend(metric, duration.as_secs_f64() * 1000.0)
    }
}

/// Accumulated statistics for one metric.
#[derive(Debug, Clone)]
pub struct MetricState {
    kind: MetricKind,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    passes: u64,
    histogram: Option<Histogram<u64>>,
}

impl MetricState {
    fn new(kind: MetricKind) -> Self {
        let histogram = match kind {
            MetricKind::Trend => Some(
                Histogram::new(SIGNIFICANT_DIGITS).expect("Failed to create histogram"),
            ),
            MetricKind::Rate | MetricKind::Counter => None,
        };
        Self {
            kind,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            passes: 0,
            histogram,
        }
    }

    /// Build a state directly from values, outside of a collector.
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a SampleValue>) -> Option<Self> {
        let mut state: Option<MetricState> = None;
        for value in samples {
            let s = state.get_or_insert_with(|| MetricState::new(value.kind()));
            if s.kind != value.kind() {
                return None;
            }
            s.record(value);
        }
        state
    }

    fn record(&mut self, value: &SampleValue) {
        let v = match *value {
            SampleValue::Trend(v) | SampleValue::Counter(v) => v,
            SampleValue::Rate(true) => {
                self.passes += 1;
                1.0
            }
            SampleValue::Rate(false) => 0.0,
        };
        self.count += 1;
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        if let Some(ref mut histogram) = self.histogram {
            // Negative and non-finite values land in the zero bucket.
            histogram.record((v * HISTOGRAM_SCALE).round() as u64).ok();
        }
    }

    fn merge(&mut self, other: &MetricState) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.passes += other.passes;
        if let (Some(mine), Some(theirs)) = (self.histogram.as_mut(), other.histogram.as_ref()) {
            mine.add(theirs).ok();
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    /// True outcomes (rate metrics).
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// False outcomes (rate metrics).
    pub fn fails(&self) -> u64 {
        match self.kind {
            MetricKind::Rate => self.count - self.passes,
            _ => 0,
        }
    }

    /// Fraction of true outcomes. `None` unless this is a rate metric.
    pub fn rate(&self) -> Option<f64> {
        match self.kind {
            MetricKind::Rate if self.count > 0 => Some(self.passes as f64 / self.count as f64),
            MetricKind::Rate => Some(0.0),
            _ => None,
        }
    }

    /// Value at percentile `p` (0–100). `None` unless this is a non-empty trend.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let histogram = self.histogram.as_ref()?;
        if self.count == 0 {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let value = histogram.value_at_quantile(quantile) as f64 / HISTOGRAM_SCALE;
        Some(value.clamp(self.min(), self.max()))
    }

    /// Reduce to reportable values. `run_duration` turns counters into per-second rates.
    pub fn values(&self, run_duration: Duration) -> MetricValues {
        let mut values = MetricValues {
            count: self.count,
            ..Default::default()
        };
        match self.kind {
            MetricKind::Trend => {
                values.avg = Some(self.avg());
                values.min = Some(self.min());
                values.med = self.percentile(50.0);
                values.max = Some(self.max());
                values.p90 = self.percentile(90.0);
                values.p95 = self.percentile(95.0);
                values.p99 = self.percentile(99.0);
            }
            MetricKind::Rate => {
                values.rate = self.rate();
                values.passes = Some(self.passes);
                values.fails = Some(self.fails());
            }
            MetricKind::Counter => {
                let secs = run_duration.as_secs_f64();
                values.sum = Some(self.sum);
                values.rate = Some(if secs > 0.0 { self.sum / secs } else { 0.0 });
            }
        }
        values
    }
}

/// Reportable values of a metric; fields not defined for its kind are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fails: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub med: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(rename = "p(90)", skip_serializing_if = "Option::is_none")]
    pub p90: Option<f64>,
    #[serde(rename = "p(95)", skip_serializing_if = "Option::is_none")]
    pub p95: Option<f64>,
    #[serde(rename = "p(99)", skip_serializing_if = "Option::is_none")]
    pub p99: Option<f64>,
}

/// Immutable view of every metric at one instant.
#[derive(Debug, Clone, Default)]
pub struct MetricSnapshot {
    metrics: BTreeMap<String, MetricState>,
}

impl MetricSnapshot {
    pub fn get(&self, metric: &str) -> Option<&MetricState> {
        self.metrics.get(metric)
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.metrics.contains_key(metric)
    }

    /// Metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricState)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl FromIterator<(String, MetricState)> for MetricSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, MetricState)>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}

#[derive(Default)]
struct Shard {
    metrics: HashMap<String, MetricState>,
}

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Stable per-thread shard hint, assigned round-robin on first use.
fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

/// Thread-safe, append-only sink for samples.
pub struct MetricCollector {
    shards: Vec<Mutex<Shard>>,
    kinds: RwLock<HashMap<String, MetricKind>>,
    frozen: AtomicBool,
}

impl MetricCollector {
    /// Create a collector with one shard per available core.
    pub fn new() -> Self {
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_shards(shards)
    }

    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::default())).collect(),
            kinds: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Record one sample.
    pub fn append(&self, sample: Sample) -> Result<(), MetricError> {
        self.append_batch(vec![sample])
    }

    /// Record a batch of samples atomically: either every sample is recorded or,
    /// on a kind mismatch or after freeze, none are.
    pub fn append_batch(&self, samples: Vec<Sample>) -> Result<(), MetricError> {
        if samples.is_empty() {
            return Ok(());
        }
        if self.is_frozen() {
            return Err(MetricError::Frozen(samples[0].metric.clone()));
        }
        self.register_kinds(&samples)?;

        let shard = &self.shards[shard_hint() % self.shards.len()];
        let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the shard lock so freeze() cannot interleave with this write.
        if self.frozen.load(Ordering::SeqCst) {
            return Err(MetricError::Frozen(samples[0].metric.clone()));
        }
        for sample in samples {
            shard
                .metrics
                .entry(sample.metric)
                .or_insert_with(|| MetricState::new(sample.value.kind()))
                .record(&sample.value);
        }
        Ok(())
    }

    /// Validate every sample's kind against the registry. New metric kinds are
    /// registered only when the whole batch is consistent.
    fn register_kinds(&self, samples: &[Sample]) -> Result<(), MetricError> {
        {
            let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
            let mut all_known = true;
            for sample in samples {
                match kinds.get(&sample.metric) {
                    Some(&expected) => mismatch(&sample.metric, expected, sample.value.kind())?,
                    None => all_known = false,
                }
            }
            if all_known {
                return Ok(());
            }
        }

        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        let mut pending: HashMap<&str, MetricKind> = HashMap::new();
        for sample in samples {
            let actual = sample.value.kind();
            let expected = kinds
                .get(&sample.metric)
                .or_else(|| pending.get(sample.metric.as_str()))
                .copied()
                .unwrap_or(actual);
            mismatch(&sample.metric, expected, actual)?;
            if !kinds.contains_key(&sample.metric) {
                pending.insert(sample.metric.as_str(), actual);
            }
        }
        for (metric, kind) in pending {
            kinds.insert(metric.to_string(), kind);
        }
        Ok(())
    }

    /// Reject all further writes. Returns once no write is in progress.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        for shard in &self.shards {
            drop(shard.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Merge every shard into an owned snapshot.
    pub fn snapshot(&self) -> MetricSnapshot {
        let mut merged: BTreeMap<String, MetricState> = BTreeMap::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            for (name, state) in &shard.metrics {
                match merged.get_mut(name) {
                    Some(existing) => existing.merge(state),
                    None => {
                        merged.insert(name.clone(), state.clone());
                    }
                }
            }
        }
        MetricSnapshot { metrics: merged }
    }
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatch(metric: &str, expected: MetricKind, actual: MetricKind) -> Result<(), MetricError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MetricError::KindMismatch {
            metric: metric.to_string(),
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn trend_state(values: &[f64]) -> MetricState {
        let samples: Vec<SampleValue> = values.iter().map(|v| SampleValue::Trend(*v)).collect();
        MetricState::from_samples(&samples).unwrap()
    }

    #[test]
    fn test_trend_statistics() {
        let state = trend_state(&[100.0, 150.0, 200.0, 490.0, 510.0]);
        assert_eq!(state.kind(), MetricKind::Trend);
        assert_eq!(state.count(), 5);
        assert_eq!(state.min(), 100.0);
        assert_eq!(state.max(), 510.0);
        assert!((state.avg() - 290.0).abs() < 1e-9);
        assert_eq!(state.percentile(95.0), Some(510.0));
        let med = state.percentile(50.0).unwrap();
        assert!((med - 200.0).abs() <= 0.2, "median {}", med);
    }

    #[test]
    fn test_percentile_error_bound() {
        let values: Vec<f64> = (1..=1000).map(|v| v as f64).collect();
        let state = trend_state(&values);
        for (p, expected) in [(50.0, 500.0), (90.0, 900.0), (99.0, 990.0)] {
            let got = state.percentile(p).unwrap();
            assert!(
                (got - expected).abs() / expected <= 0.001,
                "p{} = {}, expected {}",
                p,
                got,
                expected
            );
        }
    }

    #[test]
    fn test_rate_statistics() {
        let samples = [
            SampleValue::Rate(true),
            SampleValue::Rate(false),
            SampleValue::Rate(true),
            SampleValue::Rate(true),
        ];
        let state = MetricState::from_samples(&samples).unwrap();
        assert_eq!(state.rate(), Some(0.75));
        assert_eq!(state.passes(), 3);
        assert_eq!(state.fails(), 1);
        assert_eq!(state.percentile(95.0), None);
    }

    #[test]
    fn test_counter_values_use_run_duration() {
        let samples = [SampleValue::Counter(10.0), SampleValue::Counter(30.0)];
        let state = MetricState::from_samples(&samples).unwrap();
        let values = state.values(Duration::from_secs(4));
        assert_eq!(values.count, 2);
        assert_eq!(values.sum, Some(40.0));
        assert_eq!(values.rate, Some(10.0));
        assert_eq!(values.p95, None);
    }

    #[test]
    fn test_from_samples_rejects_mixed_kinds() {
        let samples = [SampleValue::Trend(1.0), SampleValue::Rate(true)];
        assert!(MetricState::from_samples(&samples).is_none());
    }

    #[test]
    fn test_append_and_snapshot() {
        let collector = MetricCollector::with_shards(2);
        collector.append(Sample::trend("latency", 12.5)).unwrap();
        collector.append(Sample::rate("ok", true)).unwrap();
        collector
            .append_batch(vec![Sample::trend("latency", 7.5), Sample::counter("bytes", 100.0)])
            .unwrap();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("latency").unwrap().count(), 2);
        assert_eq!(snapshot.get("latency").unwrap().min(), 7.5);
        assert_eq!(snapshot.get("bytes").unwrap().sum(), 100.0);
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["bytes", "latency", "ok"]);
    }

    #[test]
    fn test_kind_mismatch_rejects_whole_batch() {
        let collector = MetricCollector::with_shards(1);
        collector.append(Sample::trend("latency", 1.0)).unwrap();
        let err = collector
            .append_batch(vec![Sample::trend("other", 1.0), Sample::rate("latency", true)])
            .unwrap_err();
        assert_eq!(
            err,
            MetricError::KindMismatch {
                metric: "latency".to_string(),
                expected: MetricKind::Trend,
                actual: MetricKind::Rate,
            }
        );
        assert!(!collector.snapshot().contains("other"));
    }

    #[test]
    fn test_rejected_batch_registers_no_kinds() {
        let collector = MetricCollector::with_shards(1);
        collector.append(Sample::trend("latency", 1.0)).unwrap();
        assert!(collector
            .append_batch(vec![Sample::trend("other", 1.0), Sample::rate("latency", true)])
            .is_err());

        // `other` never recorded a sample, so any kind may still claim it.
        collector.append(Sample::rate("other", true)).unwrap();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.get("other").unwrap().kind(), MetricKind::Rate);
        assert_eq!(snapshot.get("latency").unwrap().count(), 1);
    }

    #[test]
    fn test_mixed_kinds_within_one_batch_rejected() {
        let collector = MetricCollector::with_shards(1);
        let err = collector
            .append_batch(vec![Sample::trend("fresh", 1.0), Sample::counter("fresh", 1.0)])
            .unwrap_err();
        assert!(matches!(err, MetricError::KindMismatch { ref metric, .. } if metric == "fresh"));
        collector.append(Sample::counter("fresh", 2.0)).unwrap();
        assert_eq!(collector.snapshot().get("fresh").unwrap().sum(), 2.0);
    }

    #[test]
    fn test_frozen_collector_rejects_writes() {
        let collector = MetricCollector::with_shards(1);
        collector.append(Sample::trend("latency", 1.0)).unwrap();
        collector.freeze();
        assert!(collector.is_frozen());
        assert_eq!(
            collector.append(Sample::trend("latency", 2.0)),
            Err(MetricError::Frozen("latency".to_string()))
        );
        assert_eq!(collector.snapshot().get("latency").unwrap().count(), 1);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let collector = Arc::new(MetricCollector::with_shards(4));
        let threads = 8;
        let per_thread = 2_000;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        collector
                            .append(Sample::trend("latency", (t * per_thread + i) as f64))
                            .unwrap();
                        collector.append(Sample::rate("ok", i % 2 == 0)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collector.snapshot();
        let latency = snapshot.get("latency").unwrap();
        assert_eq!(latency.count(), (threads * per_thread) as u64);
        assert_eq!(latency.min(), 0.0);
        assert_eq!(latency.max(), (threads * per_thread - 1) as f64);
        assert_eq!(snapshot.get("ok").unwrap().passes(), (threads * per_thread / 2) as u64);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let collector = MetricCollector::with_shards(3);
        for v in [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0] {
            collector.append(Sample::trend("latency", v)).unwrap();
        }
        collector.freeze();
        let a = collector.snapshot();
        let b = collector.snapshot();
        let run = Duration::from_secs(1);
        assert_eq!(
            a.get("latency").unwrap().values(run),
            b.get("latency").unwrap().values(run)
        );
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(names::step_duration("ping"), "http_req_duration{step:ping}");
        assert_eq!(names::check("status is 200"), "checks{check:status is 200}");
    }
}
