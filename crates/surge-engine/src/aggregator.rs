//! Concurrent metrics aggregation.
//!
//! Outcomes are sharded by tag: the tag map sits behind a read-mostly
//! `RwLock` and every series has its own mutex, so writers on different
//! tags never contend. The global series is merged from the shards on read.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use surge_core::{metrics, RequestOutcome};

/// Lowest trackable latency in microseconds.
const LATENCY_LOW_US: u64 = 1;
/// Highest trackable latency in microseconds; slower requests saturate.
const LATENCY_HIGH_US: u64 = 60_000_000;
const LATENCY_SIGFIG: u8 = 3;

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(LATENCY_LOW_US, LATENCY_HIGH_US, LATENCY_SIGFIG)
        .expect("latency histogram bounds are valid")
}

/// Running statistics for one tag.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    total: u64,
    failures: u64,
    http_failures: u64,
    skipped: u64,
    latency: Histogram<u64>,
}

impl Default for MetricSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSeries {
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: 0,
            failures: 0,
            http_failures: 0,
            skipped: 0,
            latency: new_histogram(),
        }
    }

    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.total += 1;
        if !outcome.is_success() {
            self.failures += 1;
        }
        if outcome.is_http_failure() {
            self.http_failures += 1;
        }
        let micros = u64::try_from(outcome.duration.as_micros()).unwrap_or(u64::MAX);
        self.latency.saturating_record(micros.max(LATENCY_LOW_US));
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Folds another series into this one.
    pub fn merge(&mut self, other: &MetricSeries) {
        self.total += other.total;
        self.failures += other.failures;
        self.http_failures += other.http_failures;
        self.skipped += other.skipped;
        if let Err(e) = self.latency.add(&other.latency) {
            tracing::warn!(error = ?e, "Failed to merge latency histogram");
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            total: self.total,
            failures: self.failures,
            http_failures: self.http_failures,
            skipped: self.skipped,
            latency: self.latency.clone(),
        }
    }
}

/// Point-in-time copy of a [`MetricSeries`].
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub total: u64,
    pub failures: u64,
    pub http_failures: u64,
    pub skipped: u64,
    latency: Histogram<u64>,
}

impl Default for SeriesSnapshot {
    fn default() -> Self {
        MetricSeries::new().snapshot()
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

impl SeriesSnapshot {
    /// Failed checks over performed steps. Zero for an empty series.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        ratio(self.failures, self.total)
    }

    /// Transport failures and 4xx/5xx responses over performed steps.
    #[must_use]
    pub fn http_failure_rate(&self) -> f64 {
        ratio(self.http_failures, self.total)
    }

    /// Latency at percentile `p` (0-100] in milliseconds.
    #[must_use]
    pub fn percentile_ms(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        us_to_ms(self.latency.value_at_percentile(p))
    }

    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.latency.mean() / 1000.0
    }

    #[must_use]
    pub fn min_ms(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        us_to_ms(self.latency.min())
    }

    #[must_use]
    pub fn max_ms(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        us_to_ms(self.latency.max())
    }

    #[must_use]
    pub fn median_ms(&self) -> f64 {
        self.percentile_ms(50.0)
    }
}

/// Everything the evaluator and reporter read, taken at one instant.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    /// Time since the aggregator was created.
    pub elapsed: Duration,
    pub iterations: u64,
    pub vus_started: u64,
    pub active_vus: u64,
    pub peak_vus: u64,
    pub global: SeriesSnapshot,
    pub tags: BTreeMap<String, SeriesSnapshot>,
}

impl AggregateSnapshot {
    /// The series for `tag`, or the global one. Unknown tags yield an empty series.
    #[must_use]
    pub fn series(&self, tag: Option<&str>) -> SeriesSnapshot {
        match tag {
            Some(tag) => self.tags.get(tag).cloned().unwrap_or_default(),
            None => self.global.clone(),
        }
    }

    /// Performed steps per second over the elapsed time.
    #[must_use]
    pub fn request_rate(&self) -> f64 {
        per_second(self.global.total, self.elapsed)
    }

    #[must_use]
    pub fn iteration_rate(&self) -> f64 {
        per_second(self.iterations, self.elapsed)
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0.0
    } else {
        count as f64 / secs
    }
}

/// Thread-safe sink for outcomes from every virtual user.
#[derive(Debug)]
pub struct MetricsAggregator {
    series: RwLock<HashMap<String, Arc<Mutex<MetricSeries>>>>,
    iterations: AtomicU64,
    vus_started: AtomicU64,
    active_vus: AtomicU64,
    peak_vus: AtomicU64,
    started: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            iterations: AtomicU64::new(0),
            vus_started: AtomicU64::new(0),
            active_vus: AtomicU64::new(0),
            peak_vus: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn shard(&self, tag: &str) -> Arc<Mutex<MetricSeries>> {
        if let Some(series) = self.series.read().get(tag) {
            return Arc::clone(series);
        }
        let mut map = self.series.write();
        Arc::clone(map.entry(tag.to_string()).or_default())
    }

    /// Ingests one outcome.
    pub fn record(&self, outcome: RequestOutcome) {
        metrics::observe_outcome(&outcome);
        self.shard(&outcome.tag).lock().record(&outcome);
    }

    /// Counts a step that was skipped because a setup variable was missing.
    pub fn record_skip(&self, tag: &str) {
        self.shard(tag).lock().record_skip();
    }

    /// Counts one completed pass through the action sequence.
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        metrics::ITERATIONS_TOTAL.inc();
    }

    pub fn vu_started(&self) {
        self.vus_started.fetch_add(1, Ordering::Relaxed);
        let active = self.active_vus.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_vus.fetch_max(active, Ordering::AcqRel);
        metrics::ACTIVE_VUS.inc();
    }

    pub fn vu_stopped(&self) {
        self.active_vus.fetch_sub(1, Ordering::AcqRel);
        metrics::ACTIVE_VUS.dec();
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Consistent copy of every series plus the global merge.
    #[must_use]
    pub fn snapshot(&self) -> AggregateSnapshot {
        let shards: Vec<(String, Arc<Mutex<MetricSeries>>)> = self
            .series
            .read()
            .iter()
            .map(|(tag, series)| (tag.clone(), Arc::clone(series)))
            .collect();

        let mut global = MetricSeries::new();
        let mut tags = BTreeMap::new();
        for (tag, shard) in shards {
            let series = shard.lock().clone();
            global.merge(&series);
            tags.insert(tag, series.snapshot());
        }

        AggregateSnapshot {
            elapsed: self.elapsed(),
            iterations: self.iterations.load(Ordering::Relaxed),
            vus_started: self.vus_started.load(Ordering::Relaxed),
            active_vus: self.active_vus.load(Ordering::Relaxed),
            peak_vus: self.peak_vus.load(Ordering::Relaxed),
            global: global.snapshot(),
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use surge_core::{OutcomeStatus, VuId};

    fn outcome(tag: &str, ms: u64, status: OutcomeStatus, http_status: Option<u16>) -> RequestOutcome {
        RequestOutcome {
            tag: tag.to_string(),
            timestamp: SystemTime::now(),
            duration: Duration::from_millis(ms),
            status,
            http_status,
            vu: VuId::new(1),
            iteration: 0,
            error: None,
        }
    }

    #[test]
    fn test_failure_rate_is_exact() {
        let aggregator = MetricsAggregator::new();
        for i in 0..7 {
            let status = if i < 3 { OutcomeStatus::Failure } else { OutcomeStatus::Success };
            aggregator.record(outcome("list_hotels", 10, status, Some(200)));
        }

        let snapshot = aggregator.snapshot();
        let series = &snapshot.tags["list_hotels"];
        assert_eq!(series.total, 7);
        assert_eq!(series.failures, 3);
        assert_eq!(series.failure_rate(), 3.0 / 7.0);
        assert_eq!(series.http_failure_rate(), 0.0);
    }

    #[test]
    fn test_http_failures_counted_separately() {
        let aggregator = MetricsAggregator::new();
        // Expected 401 passes its check but still is an HTTP failure.
        aggregator.record(outcome("get_bookings", 5, OutcomeStatus::Success, Some(401)));
        aggregator.record(outcome("get_bookings", 5, OutcomeStatus::Failure, None));
        aggregator.record(outcome("get_bookings", 5, OutcomeStatus::Success, Some(200)));

        let series = aggregator.snapshot().series(Some("get_bookings"));
        assert_eq!(series.failures, 1);
        assert_eq!(series.http_failures, 2);
    }

    #[test]
    fn test_global_merges_tags() {
        let aggregator = MetricsAggregator::new();
        aggregator.record(outcome("a", 10, OutcomeStatus::Success, Some(200)));
        aggregator.record(outcome("b", 30, OutcomeStatus::Failure, Some(500)));
        aggregator.record_skip("c");

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.global.total, 2);
        assert_eq!(snapshot.global.failures, 1);
        assert_eq!(snapshot.global.skipped, 1);
        assert_eq!(snapshot.tags.len(), 3);
        assert_eq!(snapshot.tags["c"].total, 0);
        assert!((snapshot.global.max_ms() - 30.0).abs() < 0.1);
        assert!((snapshot.global.min_ms() - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_empty_series_reads_zero() {
        let snapshot = MetricsAggregator::new().snapshot();
        let series = snapshot.series(Some("missing"));
        assert_eq!(series.total, 0);
        assert_eq!(series.failure_rate(), 0.0);
        assert_eq!(series.percentile_ms(95.0), 0.0);
        assert_eq!(series.mean_ms(), 0.0);
        assert_eq!(series.min_ms(), 0.0);
    }

    #[test]
    fn test_percentiles_within_precision() {
        let aggregator = MetricsAggregator::new();
        for ms in 1..=100 {
            aggregator.record(outcome("t", ms, OutcomeStatus::Success, Some(200)));
        }

        let series = aggregator.snapshot().global;
        // Three significant digits keep the error under 0.1%.
        assert!((series.percentile_ms(95.0) - 95.0).abs() < 0.1);
        assert!((series.median_ms() - 50.0).abs() < 0.1);
        assert!((series.mean_ms() - 50.5).abs() < 0.1);
    }

    #[test]
    fn test_latency_saturates() {
        let mut series = MetricSeries::new();
        series.record(&outcome("slow", 120_000, OutcomeStatus::Failure, None));
        let snapshot = series.snapshot();
        assert_eq!(snapshot.total, 1);
        assert!(snapshot.max_ms() <= 60_100.0);
    }

    #[test]
    fn test_vu_counters() {
        let aggregator = MetricsAggregator::new();
        aggregator.vu_started();
        aggregator.vu_started();
        aggregator.vu_stopped();
        aggregator.vu_started();
        aggregator.record_iteration();

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.vus_started, 3);
        assert_eq!(snapshot.active_vus, 2);
        assert_eq!(snapshot.peak_vus, 2);
        assert_eq!(snapshot.iterations, 1);
    }
}
