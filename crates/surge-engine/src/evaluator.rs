//! Threshold evaluation against aggregated snapshots.

use std::time::Duration;

use serde::Serialize;
use surge_core::{Aggregation, Threshold, ThresholdMetric};

use crate::aggregator::AggregateSnapshot;

/// Result of checking one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    /// Metric key, e.g. `http_req_duration{list_hotels}`.
    pub key: String,
    /// Canonical expression, e.g. `p(95)<500`.
    pub expression: String,
    pub observed: f64,
    pub passed: bool,
    pub abort_on_fail: bool,
}

/// Verdicts for every threshold plus the overall result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub thresholds: Vec<ThresholdVerdict>,
}

impl Verdict {
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdVerdict> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}

/// Reads snapshots and never mutates them, so evaluating the same snapshot
/// twice gives the same verdict.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    thresholds: Vec<Threshold>,
}

impl ThresholdEvaluator {
    #[must_use]
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    #[must_use]
    pub fn evaluate(&self, snapshot: &AggregateSnapshot) -> Verdict {
        let thresholds: Vec<ThresholdVerdict> = self
            .thresholds
            .iter()
            .map(|threshold| {
                let observed = observe(threshold, snapshot);
                ThresholdVerdict {
                    key: threshold.key(),
                    expression: threshold.expression(),
                    observed,
                    passed: threshold.passes(observed),
                    abort_on_fail: threshold.abort_on_fail,
                }
            })
            .collect();

        Verdict {
            passed: thresholds.iter().all(|t| t.passed),
            thresholds,
        }
    }

    /// The first failing `abort_on_fail` threshold whose grace period has
    /// passed, given `load_elapsed` since the load phase started.
    #[must_use]
    pub fn abort_breach(
        &self,
        snapshot: &AggregateSnapshot,
        load_elapsed: Duration,
    ) -> Option<ThresholdVerdict> {
        self.thresholds
            .iter()
            .filter(|t| t.abort_on_fail && load_elapsed >= t.abort_grace)
            .find_map(|threshold| {
                let observed = observe(threshold, snapshot);
                (!threshold.passes(observed)).then(|| ThresholdVerdict {
                    key: threshold.key(),
                    expression: threshold.expression(),
                    observed,
                    passed: false,
                    abort_on_fail: true,
                })
            })
    }
}

/// The value a threshold compares against its limit. Empty series read as zero.
fn observe(threshold: &Threshold, snapshot: &AggregateSnapshot) -> f64 {
    let series = snapshot.series(threshold.tag.as_deref());

    match (threshold.metric, threshold.aggregation) {
        (ThresholdMetric::HttpReqDuration, Aggregation::Avg) => series.mean_ms(),
        (ThresholdMetric::HttpReqDuration, Aggregation::Min) => series.min_ms(),
        (ThresholdMetric::HttpReqDuration, Aggregation::Max) => series.max_ms(),
        (ThresholdMetric::HttpReqDuration, Aggregation::Med) => series.median_ms(),
        (ThresholdMetric::HttpReqDuration, Aggregation::Percentile(p)) => series.percentile_ms(p),
        (ThresholdMetric::HttpReqFailed, _) => series.http_failure_rate(),
        (ThresholdMetric::Errors, _) => series.failure_rate(),
        (ThresholdMetric::HttpReqs, Aggregation::Count) => series.total as f64,
        (ThresholdMetric::HttpReqs, _) => {
            let secs = snapshot.elapsed.as_secs_f64();
            if secs == 0.0 {
                0.0
            } else {
                series.total as f64 / secs
            }
        }
        (ThresholdMetric::Iterations, Aggregation::Count) => snapshot.iterations as f64,
        (ThresholdMetric::Iterations, _) => snapshot.iteration_rate(),
        // Rejected when the threshold is parsed.
        (ThresholdMetric::HttpReqDuration, Aggregation::Rate | Aggregation::Count) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsAggregator;
    use std::time::SystemTime;
    use surge_core::{OutcomeStatus, RequestOutcome, VuId};

    fn record(aggregator: &MetricsAggregator, tag: &str, ms: u64, ok: bool) {
        aggregator.record(RequestOutcome {
            tag: tag.to_string(),
            timestamp: SystemTime::now(),
            duration: Duration::from_millis(ms),
            status: if ok { OutcomeStatus::Success } else { OutcomeStatus::Failure },
            http_status: Some(if ok { 200 } else { 500 }),
            vu: VuId::new(1),
            iteration: 0,
            error: None,
        });
    }

    fn threshold(key: &str, expr: &str) -> Threshold {
        Threshold::parse(key, expr).unwrap()
    }

    #[test]
    fn test_failure_rate_breach() {
        let aggregator = MetricsAggregator::new();
        for i in 0..10 {
            record(&aggregator, "list_hotels", 20, i % 2 == 0);
        }

        let evaluator = ThresholdEvaluator::new(vec![
            threshold("http_req_failed", "rate<0.01"),
            threshold("errors", "rate<0.6"),
            threshold("http_req_duration", "p(95)<500"),
        ]);
        let verdict = evaluator.evaluate(&aggregator.snapshot());

        assert!(!verdict.passed);
        assert_eq!(verdict.thresholds[0].observed, 0.5);
        assert!(!verdict.thresholds[0].passed);
        assert!(verdict.thresholds[1].passed);
        assert!(verdict.thresholds[2].passed);
        assert_eq!(verdict.failures().count(), 1);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let aggregator = MetricsAggregator::new();
        for ms in [10, 20, 30, 400, 900] {
            record(&aggregator, "list_hotels", ms, true);
        }
        let snapshot = aggregator.snapshot();
        let evaluator = ThresholdEvaluator::new(vec![
            threshold("http_req_duration", "p(95)<500"),
            threshold("http_req_duration{list_hotels}", "avg<1000"),
            threshold("http_reqs", "count>=5"),
        ]);

        let first = evaluator.evaluate(&snapshot);
        let second = evaluator.evaluate(&snapshot);
        assert_eq!(first, second);
        assert!(!first.thresholds[0].passed);
        assert!(first.thresholds[1].passed);
        assert_eq!(first.thresholds[2].observed, 5.0);
    }

    #[test]
    fn test_tag_scope() {
        let aggregator = MetricsAggregator::new();
        record(&aggregator, "fast", 5, true);
        record(&aggregator, "slow", 800, false);

        let evaluator = ThresholdEvaluator::new(vec![
            threshold("http_req_duration{fast}", "max<100"),
            threshold("errors{fast}", "rate==0"),
            threshold("errors{slow}", "rate==0"),
            threshold("errors{never_ran}", "rate==0"),
        ]);
        let verdict = evaluator.evaluate(&aggregator.snapshot());
        let passed: Vec<bool> = verdict.thresholds.iter().map(|t| t.passed).collect();
        assert_eq!(passed, vec![true, true, false, true]);
    }

    #[test]
    fn test_no_thresholds_pass() {
        let verdict = ThresholdEvaluator::default().evaluate(&MetricsAggregator::new().snapshot());
        assert!(verdict.passed);
        assert!(verdict.thresholds.is_empty());
    }

    #[test]
    fn test_abort_breach_respects_grace() {
        let aggregator = MetricsAggregator::new();
        record(&aggregator, "list_hotels", 10, false);
        let snapshot = aggregator.snapshot();

        let evaluator = ThresholdEvaluator::new(vec![
            threshold("errors", "rate<0.5"),
            threshold("http_req_failed", "rate<0.5").with_abort_on_fail(Duration::from_secs(10)),
        ]);

        assert!(evaluator.abort_breach(&snapshot, Duration::from_secs(5)).is_none());
        let breach = evaluator
            .abort_breach(&snapshot, Duration::from_secs(10))
            .unwrap();
        assert_eq!(breach.key, "http_req_failed");
        assert_eq!(breach.observed, 1.0);
    }
}
