// Execution status for workflows, jobs and stages
//
// Status is a closed enumeration. WAIT only ever appears while the
// dependency resolver holds a job back; everything a caller observes at
// termination is one of the four terminal variants.

use serde::{Deserialize, Serialize};

/// Status of a workflow, job, strategy or stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Waiting on upstream dependencies (resolver-internal, never terminal)
    Wait,
    /// Completed successfully
    Success,
    /// Completed with a failure
    Failed,
    /// Skipped by a condition or trigger rule
    Skip,
    /// Cancelled by the release token or a timeout
    Cancel,
}

impl Status {
    /// Whether this status is a member of the terminal set.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Wait)
    }

    /// Whether this status counts as "went through fine" when aggregating:
    /// SUCCESS and SKIP both do.
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Success | Status::Skip)
    }

    /// Severity rank used for worst-of aggregation inside a branch:
    /// FAILED > CANCEL > SKIP > SUCCESS.
    fn severity(&self) -> u8 {
        match self {
            Status::Failed => 3,
            Status::Cancel => 2,
            Status::Skip => 1,
            Status::Success => 0,
            Status::Wait => 0,
        }
    }

    /// The worse of two statuses under the branch ordering.
    pub fn worst(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Exit code used when a result is surfaced through a CLI:
    /// 0 success, 1 failed, 2 timeout is mapped by the caller, 130 cancel.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::Success | Status::Skip => 0,
            Status::Cancel => 130,
            _ => 1,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Wait => "WAIT",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
            Status::Skip => "SKIP",
            Status::Cancel => "CANCEL",
        };
        write!(f, "{s}")
    }
}

/// Aggregate a set of terminal child statuses the way jobs and workflows do:
/// SUCCESS iff every child is SUCCESS or SKIP, CANCEL iff every non-ok child
/// is CANCEL, otherwise FAILED.
pub fn aggregate(statuses: impl IntoIterator<Item = Status>) -> Status {
    let mut saw_any = false;
    let mut saw_failed = false;
    let mut saw_cancel = false;
    for st in statuses {
        saw_any = true;
        match st {
            Status::Failed => saw_failed = true,
            Status::Cancel => saw_cancel = true,
            _ => {}
        }
    }
    if !saw_any || (!saw_failed && !saw_cancel) {
        Status::Success
    } else if saw_cancel && !saw_failed {
        Status::Cancel
    } else {
        Status::Failed
    }
}

/// Worst-of aggregation for the statuses inside one branch or strategy pass.
pub fn worst_of(statuses: impl IntoIterator<Item = Status>) -> Status {
    statuses
        .into_iter()
        .fold(Status::Success, |acc, st| acc.worst(st))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_set_excludes_wait() {
        assert!(!Status::Wait.is_terminal());
        for st in [Status::Success, Status::Failed, Status::Skip, Status::Cancel] {
            assert!(st.is_terminal());
        }
    }

    #[test]
    fn aggregate_success_over_skips() {
        let st = aggregate([Status::Success, Status::Skip, Status::Success]);
        assert_eq!(st, Status::Success);
    }

    #[test]
    fn aggregate_all_cancel_collapses_to_cancel() {
        assert_eq!(aggregate([Status::Cancel, Status::Cancel]), Status::Cancel);
        // A mix of CANCEL and FAILED is FAILED
        assert_eq!(aggregate([Status::Cancel, Status::Failed]), Status::Failed);
        // CANCEL next to SUCCESS still reports CANCEL
        assert_eq!(aggregate([Status::Cancel, Status::Success]), Status::Cancel);
    }

    #[test]
    fn aggregate_empty_is_success() {
        assert_eq!(aggregate([]), Status::Success);
    }

    #[test]
    fn worst_of_ordering() {
        assert_eq!(worst_of([Status::Success, Status::Skip]), Status::Skip);
        assert_eq!(worst_of([Status::Skip, Status::Cancel]), Status::Cancel);
        assert_eq!(worst_of([Status::Cancel, Status::Failed]), Status::Failed);
    }

    #[test]
    fn serde_uses_wire_words() {
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), "\"SUCCESS\"");
        let st: Status = serde_json::from_str("\"CANCEL\"").unwrap();
        assert_eq!(st, Status::Cancel);
    }
}
