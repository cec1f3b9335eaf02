// Job runner
//
// Runs a single job: condition check, matrix expansion, one sequential
// stage pass per strategy with bounded concurrency, fail-fast via a child
// token, and job-level aggregation. Actual stage execution is delegated
// through the JobRunner capability selected by runs_on; only the local
// runner ships here, the other variants keep the same return contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cadence_core::{
    strategy_context, CoreError, ErrorRecord, Job, Result, RunsOn, Status,
};

use crate::exec::nested::run_stage_list;
use crate::exec::evaluate_condition;
use crate::runtime::ExecScope;

/// Capability contract shared by every runs_on variant: synchronous
/// execution of the job's stages given the context snapshot and the
/// release's cancellation (carried inside the scope).
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_job(&self, scope: &ExecScope, job: &Job, base_ctx: &Value) -> (Status, Value);
}

/// Resolve the runner for a job's runs_on. Non-local capabilities are
/// pluggable and not registered in this build.
pub fn runner_for(runs_on: &RunsOn) -> Result<Arc<dyn JobRunner>> {
    match runs_on {
        RunsOn::Local => Ok(Arc::new(LocalRunner)),
        other => Err(CoreError::config(format!(
            "runs_on {:?} has no runner registered in this build",
            other.kind()
        ))),
    }
}

/// In-process runner executing stages on the release's task pool.
pub struct LocalRunner;

/// Aggregate strategy statuses at the job level: SUCCESS iff every pass is
/// SUCCESS or SKIP; CANCEL only when every pass was CANCEL; else FAILED.
fn aggregate_job(statuses: &[Status]) -> Status {
    if statuses.iter().all(Status::is_ok) {
        Status::Success
    } else if !statuses.is_empty() && statuses.iter().all(|s| *s == Status::Cancel) {
        Status::Cancel
    } else {
        Status::Failed
    }
}

/// Name of the first failed stage in a pass, for the Job error message.
fn first_failed_stage(slots: &Map<String, Value>) -> Option<&str> {
    slots.iter().find_map(|(iden, slot)| {
        (slot.get("status") == Some(&json!("FAILED"))).then_some(iden.as_str())
    })
}

/// One strategy pass: stages run sequentially against the combo context.
async fn run_pass(
    scope: &ExecScope,
    job_id: &str,
    job: &Job,
    base_ctx: &Value,
    matrix: Option<Value>,
) -> (Status, Value) {
    let mut ctx = base_ctx.clone();
    if let (Some(map), Some(m)) = (ctx.as_object_mut(), &matrix) {
        map.insert("matrix".to_string(), m.clone());
    }

    let run = run_stage_list(scope, &job.stages, &ctx).await;
    let status = run.status;
    let failed_stage = first_failed_stage(&run.stages).map(str::to_string);
    let mut pass = strategy_context(matrix.as_ref(), Value::Object(run.stages), status);

    // A failed stage aborts its strategy with a Job error
    if status == Status::Failed {
        let message = match failed_stage {
            Some(stage) => format!("stage {stage:?} failed"),
            None => "strategy pass failed".to_string(),
        };
        pass.as_object_mut().expect("pass context is a mapping").insert(
            "errors".to_string(),
            json!([ErrorRecord::job(job_id, message)]),
        );
    }
    (status, pass)
}

#[async_trait]
impl JobRunner for LocalRunner {
    async fn run_job(&self, scope: &ExecScope, job: &Job, base_ctx: &Value) -> (Status, Value) {
        let job_id = job.id.as_deref().unwrap_or("job").to_string();
        let mut scope = scope.clone();
        scope.tracer = scope.tracer.with_job(&job_id);

        if let Some(condition) = &job.condition {
            match evaluate_condition(&scope.runtime.template, condition, base_ctx) {
                Ok(true) => {
                    scope.tracer.info("job skipped by condition");
                    return (Status::Skip, json!({"status": Status::Skip}));
                }
                Ok(false) => {}
                Err(err) => {
                    let record = ErrorRecord::job(&job_id, format!("condition failed: {err}"));
                    return (
                        Status::Failed,
                        json!({"status": Status::Failed, "errors": [record]}),
                    );
                }
            }
        }

        // No matrix: a single pass with an empty combo, no strategies wrapper
        if !job.strategy.is_set() {
            let (status, pass) = run_pass(&scope, &job_id, job, base_ctx, None).await;
            return (status, pass);
        }

        let combos = job.strategy.expand();
        if combos.is_empty() {
            // The whole product was excluded; nothing ran
            return (Status::Success, json!({"strategies": {}, "status": Status::Success}));
        }

        // Strategies share a child token so fail-fast cuts the siblings
        // without firing the release token.
        let strat_scope = scope.with_child_token();
        let fail_fast = job.strategy.fail_fast;
        let semaphore = Arc::new(Semaphore::new(job.strategy.max_parallel));
        let mut tasks: JoinSet<(String, Status, Value)> = JoinSet::new();

        for combo in &combos {
            let scope = strat_scope.clone();
            let job = job.clone();
            let job_id = job_id.clone();
            let base_ctx = base_ctx.clone();
            let key = combo.key.clone();
            let matrix = serde_json::to_value(&combo.values).unwrap_or_else(|_| json!({}));
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                if scope.token.is_cancelled() {
                    return (key, Status::Cancel, json!({"matrix": matrix, "status": Status::Cancel}));
                }
                let (status, pass) = run_pass(&scope, &job_id, &job, &base_ctx, Some(matrix)).await;
                (key, status, pass)
            });
        }

        let mut passes: Map<String, Value> = Map::new();
        let mut statuses = Vec::with_capacity(combos.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, status, pass)) => {
                    if fail_fast && !status.is_ok() && !strat_scope.token.is_cancelled() {
                        scope.tracer.warn(format!(
                            "strategy {key} ended {status}, cancelling remaining strategies"
                        ));
                        strat_scope.token.cancel();
                    }
                    statuses.push(status);
                    passes.insert(key, pass);
                }
                Err(err) => {
                    statuses.push(Status::Failed);
                    scope.tracer.error("strategy pass panicked", Some(err.to_string()));
                }
            }
        }

        // Re-key in expansion order for a stable context
        let mut strategies = Map::new();
        for combo in &combos {
            if let Some(pass) = passes.remove(&combo.key) {
                strategies.insert(combo.key.clone(), pass);
            }
        }

        let status = aggregate_job(&statuses);
        let mut job_ctx = Map::new();
        job_ctx.insert("strategies".to_string(), Value::Object(strategies));
        job_ctx.insert("status".to_string(), json!(status));
        if status == Status::Failed {
            let failed = statuses.iter().filter(|s| !s.is_ok()).count();
            job_ctx.insert(
                "errors".to_string(),
                json!([ErrorRecord::job(
                    &job_id,
                    format!("{failed} of {} strategies did not succeed", statuses.len())
                )]),
            );
        }
        (status, Value::Object(job_ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_aggregation_rules() {
        use Status::*;
        assert_eq!(aggregate_job(&[Success, Skip]), Success);
        assert_eq!(aggregate_job(&[Success, Failed]), Failed);
        // CANCEL is FAILED at job level unless every pass was CANCEL
        assert_eq!(aggregate_job(&[Success, Cancel]), Failed);
        assert_eq!(aggregate_job(&[Cancel, Cancel]), Cancel);
        assert_eq!(aggregate_job(&[]), Success);
    }

    #[test]
    fn first_failed_stage_finds_by_slot_status() {
        let mut slots = Map::new();
        slots.insert("a".to_string(), json!({"status": "SUCCESS"}));
        slots.insert("b".to_string(), json!({"status": "FAILED"}));
        assert_eq!(first_failed_stage(&slots), Some("b"));
    }
}
