// Stage outcomes
//
// Explicit return type for stage execution instead of exception control
// flow: a stage either succeeds with outputs, is skipped, observes
// cancellation, or fails with an error record (possibly keeping partial
// outputs such as a subprocess's captured streams).

use serde_json::{json, Map, Value};

use cadence_core::{ErrorRecord, Status};

/// Result of executing one stage.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// The stage completed and produced outputs
    Success(Map<String, Value>),
    /// The condition settled the stage without running it
    Skip,
    /// The cancel token fired before or during the stage
    Cancel,
    /// The stage failed; outputs may carry partial data (e.g. stderr)
    Fail {
        error: ErrorRecord,
        outputs: Map<String, Value>,
    },
}

impl StageOutcome {
    pub fn fail(error: ErrorRecord) -> Self {
        StageOutcome::Fail { error, outputs: Map::new() }
    }

    pub fn status(&self) -> Status {
        match self {
            StageOutcome::Success(_) => Status::Success,
            StageOutcome::Skip => Status::Skip,
            StageOutcome::Cancel => Status::Cancel,
            StageOutcome::Fail { .. } => Status::Failed,
        }
    }

    /// The `{outputs, status, errors?}` slot this outcome writes into the
    /// enclosing `stages` mapping.
    pub fn into_slot(self) -> Value {
        match self {
            StageOutcome::Success(outputs) => {
                json!({"outputs": outputs, "status": Status::Success})
            }
            StageOutcome::Skip => json!({"outputs": {}, "status": Status::Skip}),
            StageOutcome::Cancel => json!({"outputs": {}, "status": Status::Cancel}),
            StageOutcome::Fail { error, outputs } => {
                json!({"outputs": outputs, "status": Status::Failed, "errors": [error]})
            }
        }
    }
}
