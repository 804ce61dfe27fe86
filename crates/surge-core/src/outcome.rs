//! Per-request results emitted by virtual users.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::ids::VuId;

/// Whether a step's checks passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Result of one performed step.
///
/// Built once by the executor and moved into the aggregator; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Logical action the request belongs to (step name).
    pub tag: String,
    /// Wall-clock time the request was issued.
    pub timestamp: SystemTime,
    /// Time from sending the request to receiving (and reading) the response.
    pub duration: Duration,
    pub status: OutcomeStatus,
    /// HTTP status code, absent on transport failure.
    pub http_status: Option<u16>,
    pub vu: VuId,
    pub iteration: u64,
    /// Why the step failed, if it did.
    pub error: Option<String>,
}

impl RequestOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Transport failures and 4xx/5xx responses count as failed HTTP requests,
    /// independently of whether the step's checks expected them.
    #[must_use]
    pub fn is_http_failure(&self) -> bool {
        match self.http_status {
            Some(code) => code >= 400,
            None => true,
        }
    }
}
