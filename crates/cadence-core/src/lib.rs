// Workflow Model Layer
//
// This crate provides the engine-agnostic model of a YAML-defined workflow
// orchestrator: specs, params, the template engine, cron evaluation and the
// pluggable seams the execution engine consumes.
//
// Key design decisions:
// - Uses traits (WorkflowStore, TraceSink, AuditSink, Caller) for pluggable backends
// - Context values are serde_json::Value; declaration-ordered maps use IndexMap
// - Stage specs are a sum type discriminated by the presence of the variant field
// - The template grammar is a typed path walker plus a filter registry; any
//   expression the walker cannot statically parse is rejected
// - Registries (callers, filters) are explicit values built at load time and
//   read-only afterwards

pub mod audit;
pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod event;
pub mod job;
pub mod loader;
pub mod params;
pub mod registry;
pub mod result;
pub mod run_id;
pub mod stage;
pub mod status;
pub mod template;
pub mod trace;
pub mod workflow;

// Re-exports for convenience
pub use audit::{AuditRecord, AuditSink, FileAuditSink, NullAuditSink};
pub use config::Config;
pub use context::{stage_slot, strategy_context, Context};
pub use cron::{truncate_minute, CronEvaluator, CronSchedule};
pub use error::{CoreError, ErrorKind, ErrorRecord, Result};
pub use event::{On, OnEntry};
pub use job::{Combo, Job, Rule, RuleDecision, RunsOn, Strategy};
pub use loader::{FileStore, MemoryStore, WorkflowStore};
pub use params::{validate_inputs, ParamSpec, ParamType};
pub use registry::{Caller, CallerRegistry, UsesRef};
pub use result::RunResult;
pub use run_id::RunId;
pub use stage::{CaseMatch, Stage, StageAction, StageCommon};
pub use status::{aggregate, worst_of, Status};
pub use template::{FilterRegistry, Path, TemplateEngine};
pub use trace::{ConsoleSink, FileSink, TraceEvent, TraceHub, TraceLevel, TraceSink, Tracer};
pub use workflow::{Workflow, WorkflowDoc};
