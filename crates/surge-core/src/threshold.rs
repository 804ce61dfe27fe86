//! SLA-style pass/fail criteria.
//!
//! Thresholds are written as `aggregation comparison limit` against a metric
//! key, for example `http_req_duration = ["p(95)<500"]` or
//! `"http_req_failed{register_user}" = ["rate<0.01"]`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Metrics a threshold can be declared on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMetric {
    /// Request latency in milliseconds.
    HttpReqDuration,
    /// Fraction of requests that failed at the HTTP level.
    HttpReqFailed,
    /// Fraction of performed steps whose checks failed.
    Errors,
    /// Number of requests issued.
    HttpReqs,
    /// Number of completed iterations.
    Iterations,
}

impl ThresholdMetric {
    /// Parses a metric name as used in configuration keys.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "http_req_duration" => Some(Self::HttpReqDuration),
            "http_req_failed" => Some(Self::HttpReqFailed),
            "errors" => Some(Self::Errors),
            "http_reqs" => Some(Self::HttpReqs),
            "iterations" => Some(Self::Iterations),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HttpReqDuration => "http_req_duration",
            Self::HttpReqFailed => "http_req_failed",
            Self::Errors => "errors",
            Self::HttpReqs => "http_reqs",
            Self::Iterations => "iterations",
        }
    }

    fn supports(&self, aggregation: Aggregation) -> bool {
        match self {
            Self::HttpReqDuration => matches!(
                aggregation,
                Aggregation::Avg
                    | Aggregation::Min
                    | Aggregation::Max
                    | Aggregation::Med
                    | Aggregation::Percentile(_)
            ),
            Self::HttpReqFailed | Self::Errors => aggregation == Aggregation::Rate,
            Self::HttpReqs | Self::Iterations => {
                matches!(aggregation, Aggregation::Count | Aggregation::Rate)
            }
        }
    }
}

impl fmt::Display for ThresholdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a metric is reduced to a single number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `(0, 100]`.
    Percentile(f64),
    /// Ratio for rate metrics, per-second throughput for counters.
    Rate,
    Count,
}

impl Aggregation {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "med" => Some(Self::Med),
            "rate" => Some(Self::Rate),
            "count" => Some(Self::Count),
            _ => {
                let inner = text.strip_prefix("p(")?.strip_suffix(')')?;
                let p: f64 = inner.trim().parse().ok()?;
                (p > 0.0 && p <= 100.0).then_some(Self::Percentile(p))
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
            Self::Rate => f.write_str("rate"),
            Self::Count => f.write_str("count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// Whether `observed <op> limit` holds.
    #[must_use]
    pub fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Self::Lt => observed < limit,
            Self::Le => observed <= limit,
            Self::Gt => observed > limit,
            Self::Ge => observed >= limit,
            Self::Eq => (observed - limit).abs() < f64::EPSILON,
            Self::Ne => (observed - limit).abs() >= f64::EPSILON,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// A parsed threshold. Evaluation never mutates metric state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: ThresholdMetric,
    /// Restricts the threshold to one step's series; `None` means all requests.
    pub tag: Option<String>,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub limit: f64,
    /// Cancel the run as soon as a live evaluation fails.
    pub abort_on_fail: bool,
    /// Live breaches are ignored for this long after the load starts.
    #[serde(with = "humantime_serde")]
    pub abort_grace: Duration,
}

impl Threshold {
    /// Parses `expression` (e.g. `p(95)<500`) for the metric `key`
    /// (e.g. `http_req_duration` or `http_req_duration{list_hotels}`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidThreshold`] for unknown metrics, malformed
    /// expressions, or aggregations the metric does not support.
    pub fn parse(key: &str, expression: &str) -> CoreResult<Self> {
        let (metric, tag) = parse_key(key)
            .ok_or_else(|| CoreError::invalid_threshold(key, "unknown metric key"))?;

        let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
        let op_start = compact
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| CoreError::invalid_threshold(expression, "missing comparison"))?;

        let (lhs, rest) = compact.split_at(op_start);
        let (comparison, rhs) = split_comparison(rest)
            .ok_or_else(|| CoreError::invalid_threshold(expression, "unknown comparison"))?;

        let aggregation = Aggregation::parse(lhs).ok_or_else(|| {
            CoreError::invalid_threshold(expression, format!("unknown aggregation `{lhs}`"))
        })?;

        let limit: f64 = rhs.parse().map_err(|_| {
            CoreError::invalid_threshold(expression, format!("limit `{rhs}` is not a number"))
        })?;
        if !limit.is_finite() {
            return Err(CoreError::invalid_threshold(expression, "limit must be finite"));
        }

        if metric == ThresholdMetric::Iterations && tag.is_some() {
            return Err(CoreError::invalid_threshold(key, "iterations cannot be scoped to a step"));
        }

        if !metric.supports(aggregation) {
            return Err(CoreError::invalid_threshold(
                expression,
                format!("`{aggregation}` is not supported for {metric}"),
            ));
        }

        Ok(Self {
            metric,
            tag,
            aggregation,
            comparison,
            limit,
            abort_on_fail: false,
            abort_grace: Duration::ZERO,
        })
    }

    #[must_use]
    pub fn with_abort_on_fail(mut self, abort_grace: Duration) -> Self {
        self.abort_on_fail = true;
        self.abort_grace = abort_grace;
        self
    }

    /// Whether an observed value satisfies the threshold.
    #[must_use]
    pub fn passes(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.limit)
    }

    /// Metric key as written in configuration.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}{{{}}}", self.metric, tag),
            None => self.metric.to_string(),
        }
    }

    /// Canonical expression text.
    #[must_use]
    pub fn expression(&self) -> String {
        format!(
            "{}{}{}",
            self.aggregation,
            self.comparison.symbol(),
            self.limit
        )
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key(), self.expression())
    }
}

/// One configured threshold entry, either a bare expression or a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default, with = "humantime_serde")]
        abort_grace: Option<Duration>,
    },
}

impl ThresholdSpec {
    fn expression(&self) -> &str {
        match self {
            Self::Expression(expr) => expr,
            Self::Detailed { threshold, .. } => threshold,
        }
    }
}

/// Parses every configured threshold, in key order.
///
/// # Errors
///
/// Returns the first parse failure.
pub fn parse_thresholds(specs: &BTreeMap<String, Vec<ThresholdSpec>>) -> CoreResult<Vec<Threshold>> {
    let mut thresholds = Vec::new();
    for (key, entries) in specs {
        for spec in entries {
            let mut threshold = Threshold::parse(key, spec.expression())?;
            if let ThresholdSpec::Detailed {
                abort_on_fail: true,
                abort_grace,
                ..
            } = spec
            {
                threshold = threshold.with_abort_on_fail(abort_grace.unwrap_or_default());
            }
            thresholds.push(threshold);
        }
    }
    Ok(thresholds)
}

fn parse_key(key: &str) -> Option<(ThresholdMetric, Option<String>)> {
    let key = key.trim();
    match key.split_once('{') {
        Some((name, rest)) => {
            let tag = rest.strip_suffix('}')?.trim();
            if tag.is_empty() {
                return None;
            }
            Some((ThresholdMetric::from_name(name.trim())?, Some(tag.to_string())))
        }
        None => Some((ThresholdMetric::from_name(key)?, None)),
    }
}

fn split_comparison(text: &str) -> Option<(Comparison, &str)> {
    const OPERATORS: [(&str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    OPERATORS
        .iter()
        .find_map(|(symbol, cmp)| text.strip_prefix(symbol).map(|rest| (*cmp, rest)))
}
