use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-request dispatch state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchPhase {
    Validating,
    Resolving,
    Expanding,
    Dispatching,
    Awaiting,
    Merging,
    Complete,
    Failed,
}

impl DispatchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchPhase::Complete | DispatchPhase::Failed)
    }

    /// Phases only move forward. `Failed` is reachable from every non-terminal phase.
    pub fn can_advance_to(&self, next: DispatchPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == DispatchPhase::Failed || next > *self
    }
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchPhase::Validating => "VALIDATING",
            DispatchPhase::Resolving => "RESOLVING",
            DispatchPhase::Expanding => "EXPANDING",
            DispatchPhase::Dispatching => "DISPATCHING",
            DispatchPhase::Awaiting => "AWAITING",
            DispatchPhase::Merging => "MERGING",
            DispatchPhase::Complete => "COMPLETE",
            DispatchPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What happened to one endpoint of a dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointOutcome {
    /// Source id for local endpoints, peer id or ticket location for remote ones
    pub endpoint: String,
    pub relay: String,
    pub rows: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndpointOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Response header telling polling clients whether a retrieve returned everything
pub const QUERY_STATUS_HEADER: &str = "x-relay-query-status";

/// Answer to a polling submit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitResponse {
    pub id: String,
}

/// Status document for the polling transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryStatus {
    pub request_id: String,
    pub message: String,
    pub complete: bool,
    pub failed: bool,
    pub in_progress: bool,
    pub phase: DispatchPhase,
    pub rows: usize,
    pub truncated: bool,
    pub endpoints: Vec<EndpointOutcome>,
}

impl QueryStatus {
    /// Value of the status header
    pub fn label(&self) -> &'static str {
        if self.failed {
            "failed"
        } else if self.complete {
            "complete"
        } else {
            "in_progress"
        }
    }
}
