// Shared execution environment
//
// Runtime bundles everything a release needs read-only: configuration, the
// template engine, the caller registry, the workflow store and the trace
// hub. ExecScope narrows that to one release: run ids, the scoped tracer and
// the shared cancellation token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cadence_core::{
    AuditSink, CallerRegistry, Config, FileAuditSink, FilterRegistry, RunId, TemplateEngine,
    TraceHub, Tracer, WorkflowStore,
};

/// Process-wide, read-only execution environment.
pub struct Runtime {
    pub config: Config,
    pub template: TemplateEngine,
    pub callers: CallerRegistry,
    pub store: Arc<dyn WorkflowStore>,
    pub trace: TraceHub,
    pub audit: Box<dyn AuditSink>,
}

impl Runtime {
    /// Assemble a runtime from parts. The registries are read-only from here on.
    pub fn new(
        config: Config,
        store: Arc<dyn WorkflowStore>,
        callers: CallerRegistry,
        filters: FilterRegistry,
    ) -> Arc<Self> {
        let trace = TraceHub::from_config(&config);
        let audit = FileAuditSink::from_config(&config);
        Arc::new(Self {
            template: TemplateEngine::new(filters),
            config,
            callers,
            store,
            trace,
            audit,
        })
    }

    /// Runtime with default registries, for embedded and test use.
    pub fn with_defaults(config: Config, store: Arc<dyn WorkflowStore>) -> Arc<Self> {
        Self::new(config, store, CallerRegistry::new(), FilterRegistry::with_builtins())
    }
}

/// Per-release execution scope handed down to jobs and stages.
#[derive(Clone)]
pub struct ExecScope {
    pub runtime: Arc<Runtime>,
    pub run_id: RunId,
    pub parent_run_id: Option<RunId>,
    pub tracer: Tracer,
    /// Shared per-release token; descendants observe, the driver and the
    /// scheduler set
    pub token: CancellationToken,
}

impl ExecScope {
    pub fn new(runtime: Arc<Runtime>, workflow: &str, parent_run_id: Option<RunId>) -> Self {
        let run_id = RunId::generate(workflow);
        let tracer = runtime.trace.tracer(&run_id, parent_run_id.as_ref(), workflow);
        Self {
            runtime,
            run_id,
            parent_run_id,
            tracer,
            token: CancellationToken::new(),
        }
    }

    /// Same release scope with a token that can be cancelled independently
    /// without firing the release token (fail-fast strategies).
    pub fn with_child_token(&self) -> Self {
        let mut scope = self.clone();
        scope.token = self.token.child_token();
        scope
    }
}
