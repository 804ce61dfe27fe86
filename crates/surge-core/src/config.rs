//! Run configuration.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Environment variables (highest priority)
//! 2. TOML configuration file
//! 3. Built-in profile defaults (lowest priority)

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::CoreError;
use crate::profiles::Profile;
use crate::stage::{Schedule, Stage};
use crate::template::{JsonTemplate, Template};
use crate::threshold::{parse_thresholds, Threshold, ThresholdSpec};

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "surge.toml";

/// Complete description of one load-test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunSettings,

    /// Concurrency curve.
    pub stages: Vec<Stage>,

    /// Pass/fail criteria keyed by metric, e.g. `http_req_duration = ["p(95)<500"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Steps run once before any virtual user starts.
    #[serde(default)]
    pub setup: Vec<StepConfig>,

    /// Action sequence every virtual user repeats.
    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Engine settings for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Run name used in logs and reports (default: "surge")
    #[serde(default = "default_name")]
    pub name: String,

    /// Base URL relative step paths are joined to (default: "http://localhost:8080/api/v1")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Virtual users active before the first stage starts ramping (default: 0)
    #[serde(default)]
    pub start_vus: u32,

    /// Per-request timeout (default: 60s)
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How often the controller re-reads the schedule (default: 100ms)
    #[serde(default = "default_controller_tick", with = "humantime_serde")]
    pub controller_tick: Duration,

    /// How often live progress is logged and thresholds re-evaluated (default: 10s)
    #[serde(default = "default_monitor_interval", with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// How long teardown waits for in-flight virtual users (default: 30s)
    #[serde(default = "default_graceful_stop", with = "humantime_serde")]
    pub graceful_stop: Duration,
}

/// How the setup-phase credential is attached to authenticated steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Setup variable holding the token (default: "token")
    #[serde(default = "default_token_var")]
    pub token_var: String,

    /// Authorization scheme (default: "Bearer")
    #[serde(default = "default_auth_scheme")]
    pub scheme: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        };
        f.write_str(name)
    }
}

/// A JSON body assertion. Without `equals`, the pointer only has to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonCheck {
    /// RFC 6901 pointer, e.g. `/data/token`.
    pub pointer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
}

/// One named step: a request template, its checks, and the pause after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Tag the step's outcomes are recorded under.
    pub name: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Absolute URL or path relative to `run.base_url`; may contain placeholders.
    pub path: String,

    /// Send the setup credential.
    #[serde(default)]
    pub auth: bool,

    /// Setup variables that must be present, otherwise the step is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    #[serde(default = "default_expect_status")]
    pub expect_status: u16,

    /// Pause after the step, taken even when the step was skipped.
    #[serde(default, with = "humantime_serde")]
    pub pause: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect_json: Vec<JsonCheck>,

    /// Setup-only: variable name -> JSON pointer into the response body.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extract: BTreeMap<String, String>,
}

impl StepConfig {
    /// A `GET` step expecting `200` with no pause.
    #[must_use]
    pub fn get(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: HttpMethod::Get,
            path: path.into(),
            auth: false,
            requires: Vec::new(),
            expect_status: default_expect_status(),
            pause: Duration::ZERO,
            body: None,
            expect_json: Vec::new(),
            extract: BTreeMap::new(),
        }
    }

    /// A `POST` step with a JSON body.
    #[must_use]
    pub fn post(name: impl Into<String>, path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(name, path)
        }
    }

    #[must_use]
    pub fn expect_status(mut self, status: u16) -> Self {
        self.expect_status = status;
        self
    }

    #[must_use]
    pub fn expect_json(mut self, pointer: impl Into<String>, equals: Option<Value>) -> Self {
        self.expect_json.push(JsonCheck {
            pointer: pointer.into(),
            equals,
        });
        self
    }

    #[must_use]
    pub fn extract(mut self, var: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.extract.insert(var.into(), pointer.into());
        self
    }

    #[must_use]
    pub fn requires(mut self, var: impl Into<String>) -> Self {
        self.requires.push(var.into());
        self
    }

    #[must_use]
    pub fn with_auth(mut self) -> Self {
        self.auth = true;
        self
    }

    #[must_use]
    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown report format `{other}`")),
        }
    }
}

/// Where the final report goes, in addition to the console summary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub format: ReportFormat,

    /// Prometheus text exposition written at teardown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_path: Option<PathBuf>,
}

// Default value functions
fn default_name() -> String {
    "surge".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_controller_tick() -> Duration {
    Duration::from_millis(100)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_token_var() -> String {
    "token".to_string()
}

fn default_auth_scheme() -> String {
    "Bearer".to_string()
}

fn default_expect_status() -> u16 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            base_url: default_base_url(),
            start_vus: 0,
            request_timeout: default_request_timeout(),
            controller_tick: default_controller_tick(),
            monitor_interval: default_monitor_interval(),
            graceful_stop: default_graceful_stop(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_var: default_token_var(),
            scheme: default_auth_scheme(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Profile::Load.config()
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file doesn't exist or has invalid TOML syntax.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::TomlError { path, source: e })
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Uses `path` when given, otherwise `surge.toml` if it exists, otherwise
    /// the `load` profile.
    ///
    /// Supported environment variables:
    /// - `SURGE_BASE_URL` - Base URL of the system under test
    /// - `SURGE_LOG_LEVEL` - Log level
    /// - `SURGE_LOG_FORMAT` - Log format
    /// - `SURGE_REQUEST_TIMEOUT_SECS` - Per-request timeout in seconds
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                Self::from_file(path)?
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                tracing::debug!(path = DEFAULT_CONFIG_FILE, "Loading config file");
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => {
                tracing::debug!("No config file found, using the load profile");
                Self::default()
            }
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var("SURGE_BASE_URL") {
            self.run.base_url = base_url;
        }

        if let Ok(level) = std::env::var("SURGE_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("SURGE_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(secs) = std::env::var("SURGE_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.run.request_timeout = Duration::from_secs(secs);
            }
        }
    }

    /// Serialize back to TOML, e.g. to write a profile template.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// The validated concurrency curve.
    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Ok(Schedule::with_start_target(
            self.stages.clone(),
            self.run.start_vus,
        )?)
    }

    /// All parsed thresholds.
    pub fn thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        Ok(parse_thresholds(&self.thresholds)?)
    }

    /// Scheme, host and port of the base URL, without any path.
    pub fn origin(&self) -> Result<String, ConfigError> {
        let url = parse_base_url(&self.run.base_url)?;
        Ok(url.origin().ascii_serialization())
    }

    /// Validate the configuration.
    ///
    /// Everything that would make the run meaningless is rejected here, before
    /// any virtual user is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "run.name cannot be empty".to_string(),
            ));
        }

        parse_base_url(&self.run.base_url)?;

        for (field, value) in [
            ("run.request_timeout", self.run.request_timeout),
            ("run.controller_tick", self.run.controller_tick),
            ("run.monitor_interval", self.run.monitor_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "{field} must be > 0"
                )));
            }
        }

        self.schedule()?;

        if self.steps.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one step is required".to_string(),
            ));
        }

        if self.auth.token_var.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.token_var cannot be empty".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        let mut extracted = BTreeSet::new();

        for step in &self.setup {
            validate_step(step, &mut names, &extracted, &self.auth)?;
            extracted.extend(step.extract.keys().cloned());
        }

        for step in &self.steps {
            validate_step(step, &mut names, &extracted, &self.auth)?;
            if !step.extract.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "step `{}`: extract is only allowed in setup steps",
                    step.name
                )));
            }
        }

        for threshold in self.thresholds()? {
            if let Some(tag) = &threshold.tag {
                if !names.contains(tag) {
                    return Err(ConfigError::ValidationError(format!(
                        "threshold `{threshold}` refers to unknown step `{tag}`"
                    )));
                }
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        Ok(())
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| {
        ConfigError::ValidationError(format!("run.base_url `{raw}` is not a valid URL: {e}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::ValidationError(format!(
            "run.base_url must use http or https, got `{}`",
            url.scheme()
        )));
    }
    Ok(url)
}

fn validate_step(
    step: &StepConfig,
    names: &mut BTreeSet<String>,
    available: &BTreeSet<String>,
    auth: &AuthConfig,
) -> Result<(), ConfigError> {
    let invalid = |msg: String| ConfigError::ValidationError(format!("step `{}`: {msg}", step.name));

    if step.name.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "step names cannot be empty".to_string(),
        ));
    }
    if !names.insert(step.name.clone()) {
        return Err(invalid("duplicate step name".to_string()));
    }

    if !(100..=599).contains(&step.expect_status) {
        return Err(invalid(format!(
            "expect_status {} is not an HTTP status",
            step.expect_status
        )));
    }

    let mut referenced: Vec<String> = Template::parse(&step.path)?
        .setup_vars()
        .map(str::to_string)
        .collect();
    if let Some(body) = &step.body {
        referenced.extend(JsonTemplate::parse(body.clone())?.setup_vars());
    }
    referenced.extend(step.requires.iter().cloned());
    if step.auth {
        referenced.push(auth.token_var.clone());
    }

    for var in referenced {
        if !available.contains(&var) {
            return Err(invalid(format!(
                "setup variable `{var}` is never extracted by an earlier setup step"
            )));
        }
    }

    for pointer in step
        .expect_json
        .iter()
        .map(|c| c.pointer.as_str())
        .chain(step.extract.values().map(String::as_str))
    {
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(invalid(format!("`{pointer}` is not a JSON pointer")));
        }
    }

    Ok(())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse TOML in {path:?}: {source}")]
    TomlError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// TOML serialization error
    #[error("Failed to serialize config: {0}")]
    SerializeError(toml::ser::Error),

    /// Schedule, threshold or template error
    #[error(transparent)]
    Definition(#[from] CoreError),

    /// Validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
