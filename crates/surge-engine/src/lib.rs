//! Runtime for Surge load runs.
//!
//! A [`LoadRun`] runs the setup steps once, then a [`ScheduleController`]
//! keeps the number of [`VirtualUser`]s on the configured curve while each
//! of them loops over the action sequence. Outcomes flow into the
//! [`MetricsAggregator`]; the [`ThresholdEvaluator`] turns snapshots into
//! verdicts and the [`RunReport`] is built at teardown.

mod action;
mod aggregator;
mod controller;
mod error;
mod evaluator;
mod executor;
pub mod http;
mod orchestrator;
mod reporter;

pub use action::{ActionExecutor, PreparedStep, RequestTarget, SetupData, StepFailure, StepResult};
pub use aggregator::{AggregateSnapshot, MetricSeries, MetricsAggregator, SeriesSnapshot};
pub use controller::{publish_phase, ControllerSummary, ScheduleController, VuSpawner};
pub use error::{EngineError, EngineResult};
pub use evaluator::{ThresholdEvaluator, ThresholdVerdict, Verdict};
pub use executor::{run_setup, Scenario, VirtualUser, SETUP_VU};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient, TransportError};
pub use orchestrator::LoadRun;
pub use reporter::{LatencyReport, RunEnd, RunReport, SeriesReport, SetupReport, VuReport};
