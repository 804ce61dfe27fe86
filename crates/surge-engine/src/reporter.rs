//! Report generation for finished runs

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use surge_core::{ReportFormat, RunId};

use crate::aggregator::{AggregateSnapshot, SeriesSnapshot};
use crate::error::EngineResult;
use crate::evaluator::Verdict;

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunEnd {
    /// The schedule ran to completion.
    Completed,
    /// Cancelled from outside, e.g. Ctrl-C.
    Cancelled,
    /// An `abort_on_fail` threshold failed during the run.
    AbortedByThreshold { threshold: String },
}

impl RunEnd {
    fn label(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::AbortedByThreshold { threshold } => format!("aborted by threshold `{threshold}`"),
        }
    }
}

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesReport {
    pub requests: u64,
    pub failures: u64,
    pub http_failures: u64,
    pub skipped: u64,
    pub failure_rate: f64,
    pub http_failure_rate: f64,
    pub latency_ms: LatencyReport,
}

impl From<&SeriesSnapshot> for SeriesReport {
    fn from(series: &SeriesSnapshot) -> Self {
        Self {
            requests: series.total,
            failures: series.failures,
            http_failures: series.http_failures,
            skipped: series.skipped,
            failure_rate: series.failure_rate(),
            http_failure_rate: series.http_failure_rate(),
            latency_ms: LatencyReport {
                avg: series.mean_ms(),
                min: series.min_ms(),
                med: series.median_ms(),
                p90: series.percentile_ms(90.0),
                p95: series.percentile_ms(95.0),
                p99: series.percentile_ms(99.0),
                max: series.max_ms(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    /// Variables collected during setup.
    pub variables: Vec<String>,
    /// Variables setup was supposed to extract but did not.
    pub missing: Vec<String>,
}

impl SetupReport {
    /// Virtual users ran without part of their setup data.
    #[must_use]
    pub fn degraded(&self) -> bool {
        !self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VuReport {
    pub spawned: u64,
    pub peak: u64,
    pub aborted: u64,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub name: String,
    pub base_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub end: RunEnd,
    pub setup: SetupReport,
    pub vus: VuReport,
    pub iterations: u64,
    pub iterations_per_sec: f64,
    pub requests_per_sec: f64,
    pub totals: SeriesReport,
    pub steps: BTreeMap<String, SeriesReport>,
    pub verdict: Verdict,
}

impl RunReport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        name: String,
        base_url: String,
        started_at: DateTime<Utc>,
        end: RunEnd,
        setup: SetupReport,
        vus: VuReport,
        snapshot: &AggregateSnapshot,
        verdict: Verdict,
    ) -> Self {
        Self {
            run_id,
            name,
            base_url,
            started_at,
            finished_at: Utc::now(),
            duration_secs: snapshot.elapsed.as_secs_f64(),
            end,
            setup,
            vus,
            iterations: snapshot.iterations,
            iterations_per_sec: snapshot.iteration_rate(),
            requests_per_sec: snapshot.request_rate(),
            totals: SeriesReport::from(&snapshot.global),
            steps: snapshot
                .tags
                .iter()
                .map(|(tag, series)| (tag.clone(), SeriesReport::from(series)))
                .collect(),
            verdict,
        }
    }

    /// Whether every threshold passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    /// Short human-readable summary for the terminal.
    #[must_use]
    pub fn console_summary(&self) -> String {
        let mut out = String::new();
        let t = &self.totals;
        let checks_ok = t.requests - t.failures;

        let _ = writeln!(
            out,
            "\n{} `{}` {} after {:.1}s (run {})",
            if self.passed() { "✅" } else { "❌" },
            self.name,
            self.end.label(),
            self.duration_secs,
            self.run_id
        );
        let _ = writeln!(
            out,
            "   checks.............: {:.2}% ✓ {} ✗ {}",
            (1.0 - t.failure_rate) * 100.0,
            checks_ok,
            t.failures
        );
        let l = &t.latency_ms;
        let _ = writeln!(
            out,
            "   http_req_duration..: avg={:.2}ms min={:.2}ms med={:.2}ms p(90)={:.2}ms p(95)={:.2}ms max={:.2}ms",
            l.avg, l.min, l.med, l.p90, l.p95, l.max
        );
        let _ = writeln!(
            out,
            "   http_req_failed....: {:.2}% ({} of {})",
            t.http_failure_rate * 100.0,
            t.http_failures,
            t.requests
        );
        let _ = writeln!(
            out,
            "   http_reqs..........: {} {:.1}/s",
            t.requests, self.requests_per_sec
        );
        let _ = writeln!(
            out,
            "   iterations.........: {} {:.1}/s",
            self.iterations, self.iterations_per_sec
        );
        let _ = writeln!(
            out,
            "   vus_max............: {} ({} spawned)",
            self.vus.peak, self.vus.spawned
        );
        if self.setup.degraded() {
            let _ = writeln!(
                out,
                "   setup..............: degraded, missing {}",
                self.setup.missing.join(", ")
            );
        }

        if !self.verdict.thresholds.is_empty() {
            let _ = writeln!(out, "\n   thresholds:");
            for t in &self.verdict.thresholds {
                let _ = writeln!(
                    out,
                    "   {} {}: {} (observed {:.4})",
                    if t.passed { "✓" } else { "✗" },
                    t.key,
                    t.expression,
                    t.observed
                );
            }
        }
        out
    }

    /// Render the report in `format`.
    pub fn render(&self, format: ReportFormat) -> EngineResult<String> {
        Ok(match format {
            ReportFormat::Markdown => self.to_markdown(),
            ReportFormat::Json => self.to_json()?,
        })
    }

    /// Write report to file
    pub fn write(&self, path: impl AsRef<Path>, format: ReportFormat) -> EngineResult<()> {
        let content = self.render(format)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Generate Markdown report
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let pass_emoji = if self.passed() { "✅" } else { "❌" };
        let t = &self.totals;

        let mut steps = String::new();
        for (tag, s) in &self.steps {
            let _ = writeln!(
                steps,
                "| {} | {} | {} | {:.2}% | {:.2}% | {:.2}ms | {:.2}ms | {:.2}ms |",
                tag,
                s.requests,
                s.skipped,
                s.failure_rate * 100.0,
                s.http_failure_rate * 100.0,
                s.latency_ms.med,
                s.latency_ms.p95,
                s.latency_ms.max
            );
        }

        let thresholds = if self.verdict.thresholds.is_empty() {
            "No thresholds configured".to_string()
        } else {
            let mut table = String::from(
                "| Metric | Threshold | Observed | Status |\n|--------|-----------|----------|--------|\n",
            );
            for v in &self.verdict.thresholds {
                let _ = writeln!(
                    table,
                    "| {} | {} | {:.4} | {} |",
                    v.key,
                    v.expression,
                    v.observed,
                    if v.passed { "✅" } else { "❌" }
                );
            }
            table
        };

        let setup = if self.setup.degraded() {
            format!(
                "⚠️ Degraded: missing {}",
                self.setup.missing.join(", ")
            )
        } else if self.setup.variables.is_empty() {
            "No setup data".to_string()
        } else {
            format!("Collected {}", self.setup.variables.join(", "))
        };

        format!(
            r#"# Load Test Report: {}

**Status**: {} {} ({})

- **Run ID**: {}
- **Target**: {}
- **Started**: {}
- **Duration**: {:.1} seconds
- **Setup**: {}

---

## Summary

- **Total Requests**: {}
- **Failed Checks**: {} ({:.4}%)
- **HTTP Failures**: {} ({:.4}%)
- **Throughput**: {:.1} req/s
- **Iterations**: {} ({:.1}/s)
- **Peak VUs**: {} ({} spawned)

---

## Latency

| Statistic | Latency |
|-----------|---------|
| Avg | {:.2}ms |
| Min | {:.2}ms |
| Med | {:.2}ms |
| P90 | {:.2}ms |
| P95 | {:.2}ms |
| P99 | {:.2}ms |
| Max | {:.2}ms |

---

## Steps

| Step | Requests | Skipped | Failed | HTTP Failed | Med | P95 | Max |
|------|----------|---------|--------|-------------|-----|-----|-----|
{}
---

## Thresholds

{}
---

**Report Generated**: {}
"#,
            self.name,
            pass_emoji,
            if self.passed() { "PASSED" } else { "FAILED" },
            self.end.label(),
            self.run_id,
            self.base_url,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.duration_secs,
            setup,
            t.requests,
            t.failures,
            t.failure_rate * 100.0,
            t.http_failures,
            t.http_failure_rate * 100.0,
            self.requests_per_sec,
            self.iterations,
            self.iterations_per_sec,
            self.vus.peak,
            self.vus.spawned,
            t.latency_ms.avg,
            t.latency_ms.min,
            t.latency_ms.med,
            t.latency_ms.p90,
            t.latency_ms.p95,
            t.latency_ms.p99,
            t.latency_ms.max,
            steps,
            thresholds,
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::MetricsAggregator;
    use crate::evaluator::ThresholdEvaluator;
    use std::time::{Duration, SystemTime};
    use surge_core::{OutcomeStatus, RequestOutcome, Threshold, VuId};

    fn report(failures: usize) -> RunReport {
        let aggregator = MetricsAggregator::new();
        for i in 0..10 {
            aggregator.record(RequestOutcome {
                tag: "list_hotels".to_string(),
                timestamp: SystemTime::now(),
                duration: Duration::from_millis(10),
                status: if i < failures {
                    OutcomeStatus::Failure
                } else {
                    OutcomeStatus::Success
                },
                http_status: Some(if i < failures { 500 } else { 200 }),
                vu: VuId::new(1),
                iteration: 0,
                error: None,
            });
        }
        aggregator.record_skip("get_bookings");
        let snapshot = aggregator.snapshot();
        let evaluator =
            ThresholdEvaluator::new(vec![Threshold::parse("http_req_failed", "rate<0.01").unwrap()]);

        RunReport::new(
            RunId::new(),
            "load".to_string(),
            "http://localhost:8080/api/v1".to_string(),
            Utc::now(),
            RunEnd::Completed,
            SetupReport {
                variables: vec!["email".to_string()],
                missing: vec!["token".to_string()],
            },
            VuReport {
                spawned: 3,
                peak: 2,
                aborted: 0,
            },
            &snapshot,
            evaluator.evaluate(&snapshot),
        )
    }

    #[test]
    fn test_passes_when_thresholds_met() {
        let report = report(0);
        assert!(report.passed());
        assert!(report.to_markdown().contains("✅ PASSED"));
    }

    #[test]
    fn test_fails_when_thresholds_not_met() {
        let report = report(5);
        assert!(!report.passed());
        let markdown = report.to_markdown();
        assert!(markdown.contains("❌ FAILED"));
        assert!(markdown.contains("| http_req_failed | rate<0.01 | 0.5000 | ❌ |"));
        assert!(markdown.contains("Degraded: missing token"));
        assert!(report.console_summary().contains("✗ http_req_failed"));
    }

    #[test]
    fn test_json_report() {
        let report = report(5);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["end"]["status"], "completed");
        assert_eq!(json["totals"]["requests"], 10);
        assert_eq!(json["steps"]["get_bookings"]["skipped"], 1);
        assert_eq!(json["verdict"]["passed"], false);
        assert_eq!(json["verdict"]["thresholds"][0]["observed"], 0.5);
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        report(0).write(&path, ReportFormat::Markdown).unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.starts_with("# Load Test Report: load"));
    }

    #[test]
    fn test_aborted_label() {
        let end = RunEnd::AbortedByThreshold {
            threshold: "errors: rate<0.1".to_string(),
        };
        assert_eq!(end.label(), "aborted by threshold `errors: rate<0.1`");
        let json = serde_json::to_value(&end).unwrap();
        assert_eq!(json["status"], "aborted_by_threshold");
    }
}
