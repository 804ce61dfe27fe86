//! Core domain types for Surge: schedules, outcomes, thresholds, templates
//! and run configuration.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod outcome;
pub mod profiles;
pub mod stage;
pub mod template;
pub mod threshold;

pub use config::{
    AuthConfig, Config, ConfigError, HttpMethod, JsonCheck, LoggingConfig, ReportConfig,
    ReportFormat, RunSettings, StepConfig, DEFAULT_CONFIG_FILE,
};
pub use error::{CoreError, CoreResult};
pub use ids::{RunId, SlotId, VuId};
pub use outcome::{OutcomeStatus, RequestOutcome};
pub use profiles::Profile;
pub use stage::{RunPhase, Schedule, Stage};
pub use template::{JsonTemplate, Template, TemplateContext};
pub use threshold::{parse_thresholds, Aggregation, Comparison, Threshold, ThresholdMetric, ThresholdSpec};
