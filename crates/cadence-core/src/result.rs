// Release results
//
// The record a driver returns for one workflow invocation. Status reflects
// the aggregate; errors is the flat depth-first list of failure locations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorRecord;
use crate::run_id::RunId;
use crate::status::Status;

/// Outcome of one release of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: Status,
    /// Full context tree: params, jobs, status, errors
    pub context: Value,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunResult {
    /// Exit code when surfaced through a CLI. Timeouts get their own code.
    pub fn exit_code(&self) -> i32 {
        if self.status == Status::Failed && self.errors.iter().any(|e| e.message.contains("timeout"))
        {
            return 2;
        }
        self.status.exit_code()
    }

    /// Wall-clock duration of the release.
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}
