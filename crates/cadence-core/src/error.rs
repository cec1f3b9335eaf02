// Error types for the workflow core
//
// Two layers: CoreError is the thiserror enum the library returns, and
// ErrorRecord is the flat serializable record that lands in a result's
// error list and in the context tree.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure by the component that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Template expansion, filter or utility failure (local-only)
    Util,
    /// Result construction or aggregation failure
    Result,
    /// Stage execution failure (subprocess, script, callable, condition)
    Stage,
    /// Job-level dependency or strategy aggregation failure
    Job,
    /// Workflow-level failure (timeout, cycle, configuration, aggregate)
    Workflow,
    /// Input validation or coercion failure
    Param,
    /// Cron or timezone failure
    Schedule,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Util => "util",
            ErrorKind::Result => "result",
            ErrorKind::Stage => "stage",
            ErrorKind::Job => "job",
            ErrorKind::Workflow => "workflow",
            ErrorKind::Param => "param",
            ErrorKind::Schedule => "schedule",
        };
        write!(f, "{s}")
    }
}

/// A single failure location, as surfaced in `RunResult.errors` and in the
/// `errors` slot of the context tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Short name of the failure site (stage id, job id, workflow name)
    pub name: String,
    /// Human-readable message
    pub message: String,
    /// Failure classification
    pub kind: ErrorKind,
}

impl ErrorRecord {
    pub fn new(name: impl Into<String>, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn stage(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, message, ErrorKind::Stage)
    }

    pub fn job(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, message, ErrorKind::Job)
    }

    pub fn workflow(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, message, ErrorKind::Workflow)
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.name, self.message)
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the model layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Template syntax, path resolution or filter failure
    #[error("template error: {0}")]
    Template(String),

    /// Input validation, missing required param, coercion failure
    #[error("param error: {0}")]
    Param(String),

    /// Cron parsing or timezone failure
    #[error("schedule error: {0}")]
    Schedule(String),

    /// Workflow graph validation failure (cycle, unknown needs, event rules)
    #[error("workflow error: {0}")]
    Workflow(String),

    /// Stage spec or execution-contract failure
    #[error("stage error: {0}")]
    Stage(String),

    /// Caller registry lookup or invocation failure
    #[error("caller error: {0}")]
    Caller(String),

    /// Configuration failure
    #[error("config error: {0}")]
    Config(String),

    /// Workflow document loading failure
    #[error("loader error: {0}")]
    Loader(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn template(msg: impl Into<String>) -> Self {
        CoreError::Template(msg.into())
    }

    pub fn param(msg: impl Into<String>) -> Self {
        CoreError::Param(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        CoreError::Schedule(msg.into())
    }

    pub fn workflow(msg: impl Into<String>) -> Self {
        CoreError::Workflow(msg.into())
    }

    pub fn stage(msg: impl Into<String>) -> Self {
        CoreError::Stage(msg.into())
    }

    pub fn caller(msg: impl Into<String>) -> Self {
        CoreError::Caller(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Config(msg.into())
    }

    pub fn loader(msg: impl Into<String>) -> Self {
        CoreError::Loader(msg.into())
    }

    /// The ErrorKind this error surfaces as when recorded.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Template(_) => ErrorKind::Util,
            CoreError::Param(_) => ErrorKind::Param,
            CoreError::Schedule(_) => ErrorKind::Schedule,
            CoreError::Workflow(_) | CoreError::Config(_) | CoreError::Loader(_) => {
                ErrorKind::Workflow
            }
            CoreError::Stage(_) | CoreError::Caller(_) => ErrorKind::Stage,
            CoreError::Internal(_) => ErrorKind::Result,
        }
    }

    /// Convert into a flat error record attributed to `name`.
    pub fn into_record(self, name: impl Into<String>) -> ErrorRecord {
        let kind = self.kind();
        ErrorRecord::new(name, self.to_string(), kind)
    }
}
