//! Step execution: rendering, sending, checking and timing one request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use surge_core::{
    AuthConfig, CoreResult, HttpMethod, JsonCheck, JsonTemplate, OutcomeStatus, RequestOutcome,
    StepConfig, Template, TemplateContext, VuId,
};
use thiserror::Error;

use crate::http::{resolve_url, HttpClient, HttpRequest, HttpResponse};

/// Variables produced by the setup phase, shared read-only by every VU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupData {
    vars: BTreeMap<String, String>,
}

impl SetupData {
    #[must_use]
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    #[must_use]
    pub fn get(&self, var: &str) -> Option<&str> {
        self.vars.get(var).map(String::as_str)
    }

    /// Empty values count as absent.
    #[must_use]
    pub fn contains(&self, var: &str) -> bool {
        self.get(var).is_some_and(|value| !value.is_empty())
    }

    #[must_use]
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub(crate) fn insert(&mut self, var: String, value: String) {
        self.vars.insert(var, value);
    }
}

/// Why a performed step counts as failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepFailure {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("expected status {expected}, got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },

    #[error("response body is not JSON: {0}")]
    InvalidBody(String),

    #[error("`{pointer}` missing from response body")]
    MissingField { pointer: String },

    #[error("`{pointer}` is {actual}, expected {expected}")]
    FieldMismatch {
        pointer: String,
        expected: Value,
        actual: Value,
    },
}

/// A step with its templates parsed once up front.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub name: String,
    method: HttpMethod,
    path: Template,
    body: Option<JsonTemplate>,
    auth: bool,
    requires: Vec<String>,
    expect_status: u16,
    checks: Vec<JsonCheck>,
    extract: BTreeMap<String, String>,
    pub pause: std::time::Duration,
}

impl PreparedStep {
    /// # Errors
    ///
    /// Returns the first template that fails to parse.
    pub fn from_config(step: &StepConfig) -> CoreResult<Self> {
        Ok(Self {
            name: step.name.clone(),
            method: step.method,
            path: Template::parse(&step.path)?,
            body: step.body.clone().map(JsonTemplate::parse).transpose()?,
            auth: step.auth,
            requires: step.requires.clone(),
            expect_status: step.expect_status,
            checks: step.expect_json.clone(),
            extract: step.extract.clone(),
            pause: step.pause,
        })
    }

    /// The first required setup variable that is absent, if any.
    #[must_use]
    pub fn missing_requirement<'a>(
        &'a self,
        setup: &SetupData,
        auth: &'a AuthConfig,
    ) -> Option<&'a str> {
        let token = self.auth.then_some(auth.token_var.as_str());
        self.requires
            .iter()
            .map(String::as_str)
            .chain(token)
            .find(|var| !setup.contains(var))
    }

    /// Setup variables this step extracts on success.
    pub fn extracts(&self) -> impl Iterator<Item = &String> {
        self.extract.keys()
    }

    fn needs_body(&self) -> bool {
        !self.checks.is_empty() || !self.extract.is_empty()
    }
}

/// Where requests go and how they are authenticated.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub base_url: String,
    pub origin: String,
    pub auth: AuthConfig,
}

/// Result of one performed step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub outcome: RequestOutcome,
    /// Values pulled out of the response, only for successful steps that extract.
    pub extracted: BTreeMap<String, String>,
}

/// Performs steps against the system under test.
#[derive(Clone)]
pub struct ActionExecutor {
    client: Arc<dyn HttpClient>,
    target: Arc<RequestTarget>,
}

impl ActionExecutor {
    pub fn new(client: Arc<dyn HttpClient>, target: RequestTarget) -> Self {
        Self {
            client,
            target: Arc::new(target),
        }
    }

    #[must_use]
    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    /// Renders and sends `step`, then checks the response.
    ///
    /// Never fails: transport errors and failed checks end up in the
    /// returned outcome.
    pub async fn perform(
        &self,
        step: &PreparedStep,
        vu: VuId,
        iteration: u64,
        setup: &SetupData,
    ) -> StepResult {
        let request = self.render(step, vu, iteration, setup);

        let timestamp = SystemTime::now();
        let started = Instant::now();
        let response = self.client.send(request).await;
        let duration = started.elapsed();

        let (http_status, verdict) = match response {
            Ok(response) => (Some(response.status), check_response(step, &response)),
            Err(e) => (None, Err(StepFailure::Transport(e.0))),
        };

        let (status, error, extracted) = match verdict {
            Ok(extracted) => (OutcomeStatus::Success, None, extracted),
            Err(failure) => {
                tracing::debug!(vu = %vu, tag = %step.name, error = %failure, "Step failed");
                (OutcomeStatus::Failure, Some(failure.to_string()), BTreeMap::new())
            }
        };

        StepResult {
            outcome: RequestOutcome {
                tag: step.name.clone(),
                timestamp,
                duration,
                status,
                http_status,
                vu,
                iteration,
                error,
            },
            extracted,
        }
    }

    fn render(
        &self,
        step: &PreparedStep,
        vu: VuId,
        iteration: u64,
        setup: &SetupData,
    ) -> HttpRequest {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let ctx = TemplateContext {
            vu,
            iteration,
            timestamp_ms,
            base_url: &self.target.base_url,
            origin: &self.target.origin,
            setup: setup.vars(),
        };

        let mut headers = Vec::new();
        if step.auth {
            if let Some(token) = setup.get(&self.target.auth.token_var) {
                headers.push((
                    "authorization".to_string(),
                    format!("{} {}", self.target.auth.scheme, token),
                ));
            }
        }

        HttpRequest {
            method: step.method,
            url: resolve_url(&self.target.base_url, &step.path.render(&ctx)),
            headers,
            body: step.body.as_ref().map(|b| b.render(&ctx)),
        }
    }
}

fn check_response(
    step: &PreparedStep,
    response: &HttpResponse,
) -> Result<BTreeMap<String, String>, StepFailure> {
    if response.status != step.expect_status {
        return Err(StepFailure::UnexpectedStatus {
            expected: step.expect_status,
            actual: response.status,
        });
    }

    if !step.needs_body() {
        return Ok(BTreeMap::new());
    }

    let body: Value = serde_json::from_slice(&response.body)
        .map_err(|e| StepFailure::InvalidBody(e.to_string()))?;

    for check in &step.checks {
        let actual = body
            .pointer(&check.pointer)
            .ok_or_else(|| StepFailure::MissingField {
                pointer: check.pointer.clone(),
            })?;
        if let Some(expected) = &check.equals {
            if actual != expected {
                return Err(StepFailure::FieldMismatch {
                    pointer: check.pointer.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
    }

    let mut extracted = BTreeMap::new();
    for (var, pointer) in &step.extract {
        let value = body
            .pointer(pointer)
            .ok_or_else(|| StepFailure::MissingField {
                pointer: pointer.clone(),
            })?;
        // A null or empty value leaves the variable unset.
        let value = match value {
            Value::Null => continue,
            Value::String(s) if s.is_empty() => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        extracted.insert(var.clone(), value);
    }

    Ok(extracted)
}
