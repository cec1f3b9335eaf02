// Workflow driver
//
// Parameterizes inputs, runs the job scheduler, assembles the final result
// and emits the per-release audit record. Also the home of the release-time
// entry (cron-validated, with the release bundle injected into params), the
// rerun entry (replay SUCCESS jobs from prior context) and the trigger
// bridge that binds a child release to its parent's token.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use cadence_core::{
    truncate_minute, validate_inputs, AuditRecord, Context, CoreError, ErrorRecord, Result,
    RunId, RunResult, Status, Workflow,
};

use crate::outcome::StageOutcome;
use crate::runtime::{ExecScope, Runtime};
use crate::scheduler::{run_dag, ReplayPlan};

/// Drives releases of workflows resolved through the runtime's store.
#[derive(Clone)]
pub struct Driver {
    runtime: Arc<Runtime>,
}

/// How a release came to run; lands in the params bundle as `release_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseKind {
    Manual,
    Schedule,
    Rerun,
}

impl ReleaseKind {
    fn as_str(&self) -> &'static str {
        match self {
            ReleaseKind::Manual => "manual",
            ReleaseKind::Schedule => "schedule",
            ReleaseKind::Rerun => "rerun",
        }
    }
}

impl Driver {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run a workflow with caller-supplied inputs.
    pub async fn execute(&self, name: &str, inputs: Map<String, Value>) -> Result<RunResult> {
        let workflow = self.runtime.store.get(name).await?;
        self.run(workflow, inputs, None, None, None, ReleaseKind::Manual, None)
            .await
    }

    /// Run a workflow under an externally owned cancellation token. Firing
    /// the token requests cancellation of the whole release.
    pub async fn execute_cancellable(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        token: CancellationToken,
    ) -> Result<RunResult> {
        let workflow = self.runtime.store.get(name).await?;
        self.run(workflow, inputs, None, None, Some(token), ReleaseKind::Manual, None)
            .await
    }

    /// Run a workflow at a logical release time. The time must land on one
    /// of the workflow's cron schedules (minute tolerance); the release
    /// bundle `{logical_date, release_type}` is injected into params.
    pub async fn release(
        &self,
        name: &str,
        release_time: DateTime<Utc>,
        inputs: Map<String, Value>,
    ) -> Result<RunResult> {
        let workflow = self.runtime.store.get(name).await?;
        let logical = truncate_minute(release_time);
        let evaluators = workflow.on.compile(&self.runtime.config.timezone)?;
        if evaluators.is_empty() {
            return Err(CoreError::schedule(format!(
                "workflow {name:?} has no cron schedules to release on"
            )));
        }
        if !evaluators.iter().any(|eval| eval.includes_minute(logical)) {
            return Err(CoreError::schedule(format!(
                "release time {logical} does not match any schedule of {name:?}"
            )));
        }
        self.run(
            workflow,
            inputs,
            None,
            None,
            None,
            ReleaseKind::Schedule,
            Some(logical),
        )
        .await
    }

    /// Re-run a workflow from a prior release's context. Jobs whose prior
    /// terminal status is SUCCESS are replayed from prior outputs unless
    /// `force` is set; everything else (and its downstream closure)
    /// re-executes with the prior params.
    pub async fn rerun(&self, name: &str, prior_context: Value, force: bool) -> Result<RunResult> {
        let workflow = self.runtime.store.get(name).await?;
        let inputs = prior_context
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let replay = if force {
            None
        } else {
            let prior_jobs: std::collections::HashMap<String, Value> = prior_context
                .get("jobs")
                .and_then(Value::as_object)
                .map(|jobs| jobs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            let not_success: Vec<&str> = workflow
                .jobs
                .keys()
                .filter(|id| {
                    prior_jobs
                        .get(id.as_str())
                        .and_then(|j| j.get("status"))
                        .and_then(|s| serde_json::from_value::<Status>(s.clone()).ok())
                        != Some(Status::Success)
                })
                .map(String::as_str)
                .collect();
            let rerun: HashSet<String> = workflow.downstream_closure(not_success);
            Some(ReplayPlan { prior: prior_jobs, rerun })
        };

        self.run(workflow, inputs, None, replay, None, ReleaseKind::Rerun, None)
            .await
    }

    /// Release a child workflow on behalf of a trigger stage. The child's
    /// token is a child of the parent's, so parent cancellation reaches it.
    async fn trigger_child(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        parent_run_id: RunId,
        token: CancellationToken,
    ) -> Result<RunResult> {
        let workflow = self.runtime.store.get(name).await?;
        self.run(
            workflow,
            inputs,
            Some(parent_run_id),
            None,
            Some(token),
            ReleaseKind::Manual,
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        workflow: Arc<Workflow>,
        inputs: Map<String, Value>,
        parent_run_id: Option<RunId>,
        replay: Option<ReplayPlan>,
        token: Option<CancellationToken>,
        kind: ReleaseKind,
        logical_date: Option<DateTime<Utc>>,
    ) -> Result<RunResult> {
        let mut params = validate_inputs(&workflow.params, &inputs)?;
        if let Some(map) = params.as_object_mut() {
            if let Some(logical) = logical_date {
                map.insert("logical_date".to_string(), json!(logical.to_rfc3339()));
                map.insert("release_type".to_string(), json!(kind.as_str()));
            }
        }

        let mut scope = ExecScope::new(self.runtime.clone(), &workflow.name, parent_run_id);
        if let Some(token) = token {
            scope.token = token;
        }
        let started_at = Utc::now();
        scope.tracer.info(format!(
            "release {} starts ({})",
            workflow.name,
            kind.as_str()
        ));

        let mut ctx = Context::new(params);
        let status = run_dag(&scope, &workflow, &mut ctx, replay.as_ref()).await;
        let ended_at = Utc::now();

        let errors = collect_errors(&workflow, ctx.as_value());
        scope.tracer.done(
            format!("release {} ended {status}", workflow.name),
            (ended_at - started_at).num_milliseconds().max(0) as u64,
        );

        let result = RunResult {
            status,
            context: ctx.into_value(),
            run_id: scope.run_id.clone(),
            parent_run_id: scope.parent_run_id.clone(),
            errors,
            started_at,
            ended_at,
        };

        // Exactly one audit record per release, at terminal status
        if self.runtime.config.audit_enabled {
            let record = AuditRecord::new(
                &workflow.name,
                logical_date.unwrap_or_else(|| truncate_minute(started_at)),
                result.context.clone(),
                result.run_id.clone(),
                result.parent_run_id.clone(),
            );
            if let Err(err) = self.runtime.audit.save(&record).await {
                scope.tracer.warn(format!("audit save failed: {err}"));
            }
        }

        Ok(result)
    }
}

/// Flatten the error records out of a final context: workflow-level errors
/// first, then each job in declaration order, depth-first within. Stage
/// `outputs` are data and are not descended into, so a child workflow's
/// errors stay inside the trigger stage's outputs.
fn collect_errors(workflow: &Workflow, ctx: &Value) -> Vec<ErrorRecord> {
    let mut out = Vec::new();
    collect_node(ctx, false, &mut out);
    if let Some(jobs) = ctx.get("jobs").and_then(Value::as_object) {
        for job_id in workflow.jobs.keys() {
            if let Some(job_ctx) = jobs.get(job_id) {
                collect_node(job_ctx, true, &mut out);
            }
        }
    }
    out
}

fn collect_node(node: &Value, descend: bool, out: &mut Vec<ErrorRecord>) {
    let Some(map) = node.as_object() else { return };
    if let Some(errors) = map.get("errors").and_then(Value::as_array) {
        out.extend(
            errors
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok()),
        );
    }
    if !descend {
        return;
    }
    for (key, value) in map {
        if matches!(key.as_str(), "errors" | "outputs" | "matrix" | "params") {
            continue;
        }
        collect_node(value, true, out);
    }
}

/// Execute a trigger stage: run the named workflow as a child release and
/// surface its full context as the stage outputs.
pub(crate) async fn run_trigger(
    scope: &ExecScope,
    iden: &str,
    name: &str,
    params: Map<String, Value>,
) -> StageOutcome {
    let driver = Driver::new(scope.runtime.clone());
    let child = driver
        .trigger_child(
            name,
            params,
            scope.run_id.clone(),
            scope.token.child_token(),
        )
        .await;

    match child {
        Ok(result) => {
            let outputs = result
                .context
                .as_object()
                .cloned()
                .unwrap_or_default();
            match result.status {
                Status::Success | Status::Skip => StageOutcome::Success(outputs),
                Status::Cancel if scope.token.is_cancelled() => StageOutcome::Cancel,
                status => {
                    let error = ErrorRecord::stage(
                        iden,
                        format!(
                            "triggered workflow {name:?} ended {status} (run_id {})",
                            result.run_id
                        ),
                    );
                    StageOutcome::Fail { error, outputs }
                }
            }
        }
        Err(err) => StageOutcome::fail(ErrorRecord::stage(
            iden,
            format!("trigger of {name:?} failed: {err}"),
        )),
    }
}
