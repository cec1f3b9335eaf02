// Job scheduler
//
// Topological execution of a workflow's jobs: a ready queue gated by trigger
// rules, a bounded worker pool, re-evaluation on every completion with a
// short bounded backoff, and a single shared cancellation token. The
// end-to-end timeout lives here; expiry behaves like external cancellation
// but classifies the release as FAILED with a timeout error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cadence_core::{
    aggregate, Context, ErrorKind, ErrorRecord, RuleDecision, Status, Workflow,
};

use crate::runner::runner_for;
use crate::runtime::ExecScope;

/// Bounded pause before re-evaluating waiting jobs when nothing changed.
const RECHECK_BACKOFF: Duration = Duration::from_millis(75);

/// Rerun support: jobs outside the rerun set replay their prior context
/// instead of executing.
#[derive(Debug, Clone, Default)]
pub struct ReplayPlan {
    /// Prior job contexts keyed by job id
    pub prior: HashMap<String, Value>,
    /// Jobs that must actually re-execute
    pub rerun: HashSet<String>,
}

impl ReplayPlan {
    fn replayed(&self, job_id: &str) -> Option<&Value> {
        if self.rerun.contains(job_id) {
            None
        } else {
            self.prior.get(job_id)
        }
    }
}

/// Execute every job of the workflow, writing slots into the context.
/// Returns the aggregate workflow status.
pub async fn run_dag(
    scope: &ExecScope,
    workflow: &Arc<Workflow>,
    ctx: &mut Context,
    replay: Option<&ReplayPlan>,
) -> Status {
    let mut statuses: HashMap<String, Status> = workflow
        .jobs
        .keys()
        .map(|id| (id.clone(), Status::Wait))
        .collect();
    let mut running: HashSet<String> = HashSet::new();
    let mut tasks: JoinSet<(String, Status, Value)> = JoinSet::new();
    let mut task_jobs: HashMap<tokio::task::Id, String> = HashMap::new();
    let semaphore = Arc::new(Semaphore::new(scope.runtime.config.max_job_parallel));
    let deadline = tokio::time::Instant::now() + scope.runtime.config.workflow_timeout;
    let mut timed_out = false;

    // Replayed jobs settle up front: their prior terminal status stands and
    // downstream trigger rules read it like any other terminal.
    if let Some(plan) = replay {
        for job_id in workflow.jobs.keys() {
            if let Some(prior) = plan.replayed(job_id) {
                let status = prior
                    .get("status")
                    .and_then(|s| serde_json::from_value(s.clone()).ok())
                    .unwrap_or(Status::Success);
                if ctx.set_job(job_id, prior.clone()).is_ok() {
                    statuses.insert(job_id.clone(), status);
                    scope.tracer.info(format!("job {job_id} replayed from prior context"));
                }
            }
        }
    }

    loop {
        let mut progressed = false;

        if !scope.token.is_cancelled() {
            for (job_id, job) in &workflow.jobs {
                if statuses[job_id] != Status::Wait || running.contains(job_id) {
                    continue;
                }
                let upstream: Vec<Status> =
                    job.needs.iter().map(|need| statuses[need]).collect();
                match job.trigger_rule.evaluate(&upstream) {
                    RuleDecision::Wait => {}
                    RuleDecision::Skip => {
                        scope.tracer.info(format!("job {job_id} skipped by trigger rule"));
                        let _ = ctx.set_job(job_id, json!({"status": Status::Skip}));
                        statuses.insert(job_id.clone(), Status::Skip);
                        progressed = true;
                    }
                    RuleDecision::Proceed => {
                        let runner = match runner_for(&job.runs_on) {
                            Ok(runner) => runner,
                            Err(err) => {
                                let record =
                                    ErrorRecord::new(job_id, err.to_string(), ErrorKind::Job);
                                let _ = ctx.set_job(
                                    job_id,
                                    json!({"status": Status::Failed, "errors": [record]}),
                                );
                                statuses.insert(job_id.clone(), Status::Failed);
                                progressed = true;
                                continue;
                            }
                        };
                        let scope = scope.clone();
                        let workflow = workflow.clone();
                        let job_id_owned = job_id.clone();
                        let snapshot = ctx.as_value().clone();
                        let semaphore = semaphore.clone();
                        running.insert(job_id.clone());
                        progressed = true;
                        let handle = tasks.spawn(async move {
                            let _permit =
                                semaphore.acquire_owned().await.expect("semaphore open");
                            let job = workflow
                                .jobs
                                .get(&job_id_owned)
                                .expect("scheduler only spawns known jobs");
                            if scope.token.is_cancelled() {
                                return (job_id_owned, Status::Cancel, json!({"status": Status::Cancel}));
                            }
                            let (status, job_ctx) = runner.run_job(&scope, job, &snapshot).await;
                            (job_id_owned, status, job_ctx)
                        });
                        task_jobs.insert(handle.id(), job_id.clone());
                    }
                }
            }
        }

        let all_terminal = statuses.values().all(Status::is_terminal);
        if running.is_empty() && (all_terminal || scope.token.is_cancelled()) {
            break;
        }

        if tasks.is_empty() {
            if progressed {
                continue;
            }
            // Nothing running and nothing changed: bounded backoff re-check
            tokio::select! {
                _ = tokio::time::sleep(RECHECK_BACKOFF) => {}
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    timed_out = true;
                    scope.token.cancel();
                }
                _ = scope.token.cancelled() => {}
            }
            continue;
        }

        tokio::select! {
            joined = tasks.join_next_with_id() => {
                if let Some(joined) = joined {
                    let (job_id, status, job_ctx) = match joined {
                        Ok((id, done)) => {
                            task_jobs.remove(&id);
                            done
                        }
                        Err(err) => {
                            // A panicked task still settles its job as FAILED
                            scope.tracer.error("job task panicked", Some(err.to_string()));
                            match task_jobs.remove(&err.id()) {
                                Some(job_id) => {
                                    let record = ErrorRecord::new(
                                        &job_id,
                                        format!("job task panicked: {err}"),
                                        ErrorKind::Job,
                                    );
                                    let slot =
                                        json!({"status": Status::Failed, "errors": [record]});
                                    (job_id, Status::Failed, slot)
                                }
                                None => continue,
                            }
                        }
                    };
                    running.remove(&job_id);
                    scope.tracer.info(format!("job {job_id} ended {status}"));
                    if let Err(err) = ctx.set_job(&job_id, job_ctx) {
                        // Single-writer invariant: a second write is a bug
                        scope.tracer.error("job slot conflict", Some(err.to_string()));
                    }
                    statuses.insert(job_id, status);
                }
            }
            _ = tokio::time::sleep_until(deadline), if !timed_out => {
                timed_out = true;
                scope.tracer.warn("workflow timeout reached, cancelling release");
                scope.token.cancel();
            }
            _ = tokio::time::sleep(RECHECK_BACKOFF) => {}
        }
    }

    // Anything still waiting after a cancel drains to CANCEL
    for (job_id, status) in statuses.iter_mut() {
        if !status.is_terminal() {
            let _ = ctx.set_job(job_id, json!({"status": Status::Cancel}));
            *status = Status::Cancel;
        }
    }

    let status = if timed_out {
        ctx.push_error(ErrorRecord::new(
            &workflow.name,
            format!(
                "workflow timeout after {:?}",
                scope.runtime.config.workflow_timeout
            ),
            ErrorKind::Workflow,
        ));
        Status::Failed
    } else if scope.token.is_cancelled() {
        ctx.push_error(ErrorRecord::new(
            &workflow.name,
            "workflow cancelled by external request",
            ErrorKind::Workflow,
        ));
        Status::Cancel
    } else {
        let agg = aggregate(statuses.values().copied());
        if agg == Status::Failed {
            let failed: Vec<&str> = workflow
                .jobs
                .keys()
                .filter(|id| statuses[id.as_str()] == Status::Failed)
                .map(String::as_str)
                .collect();
            ctx.push_error(ErrorRecord::new(
                &workflow.name,
                format!("jobs {failed:?} did not succeed"),
                ErrorKind::Workflow,
            ));
        }
        agg
    };

    ctx.set_status(status);
    status
}
