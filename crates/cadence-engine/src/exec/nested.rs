// Nested stage executors
//
// Parallel, ForEach, Until and Case compose inner stages through
// execute_stage. Within a branch or item, inner stages run in declaration
// order and a failure aborts the remainder of that branch; across branches
// and items there is no ordering. Cancellation is observed between inner
// stages.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cadence_core::{aggregate, template::to_display_string, CaseMatch, ErrorRecord, Stage, Status};

use crate::exec::execute_stage;
use crate::outcome::StageOutcome;
use crate::runtime::ExecScope;

/// Result of running one sequential stage list (a branch, an item pass, an
/// until pass or a case arm).
pub(crate) struct StageListRun {
    pub stages: Map<String, Value>,
    pub status: Status,
}

impl StageListRun {
    /// The `{stages, status}` context this run records.
    pub fn into_context(self) -> Value {
        json!({"stages": self.stages, "status": self.status})
    }
}

/// Run stages sequentially against a base context. Each completed stage
/// publishes its slot under `stages` before the next one starts, so later
/// stages can template-reference earlier outputs. A FAILED or CANCEL stage
/// aborts the remainder of the list.
pub(crate) async fn run_stage_list(
    scope: &ExecScope,
    stages: &[Stage],
    base_ctx: &Value,
) -> StageListRun {
    let mut ctx = base_ctx.clone();
    if let Some(map) = ctx.as_object_mut() {
        map.entry("stages").or_insert_with(|| json!({}));
    }
    let mut slots = Map::new();
    let mut worst = Status::Success;

    for stage in stages {
        let iden = stage.iden().unwrap_or("stage").to_string();
        let outcome = execute_stage(scope, stage, &ctx).await;
        let stage_status = outcome.status();
        worst = worst.worst(stage_status);

        let slot = outcome.into_slot();
        slots.insert(iden.clone(), slot.clone());
        if let Some(stages_map) = ctx.get_mut("stages").and_then(Value::as_object_mut) {
            stages_map.insert(iden, slot);
        }

        if matches!(stage_status, Status::Failed | Status::Cancel) {
            break;
        }
    }

    // A list whose stages all succeeded or were skipped counts as SUCCESS
    let status = if worst.is_ok() { Status::Success } else { worst };
    StageListRun { stages: slots, status }
}

/// Aggregate child contexts under the implicit all_success rule and shape
/// the nested stage's outcome.
fn nested_outcome(
    iden: &str,
    wrapper_key: &str,
    children: Map<String, Value>,
    statuses: Vec<Status>,
    cancelled: bool,
) -> StageOutcome {
    let status = aggregate(statuses.iter().copied());
    let mut outputs = Map::new();
    outputs.insert(wrapper_key.to_string(), Value::Object(children));
    match status {
        Status::Success | Status::Skip => StageOutcome::Success(outputs),
        Status::Cancel if cancelled => StageOutcome::Cancel,
        _ => {
            let failed = statuses.iter().filter(|s| !s.is_ok()).count();
            let error = ErrorRecord::stage(
                iden,
                format!("{failed} of {} {wrapper_key} did not succeed", statuses.len()),
            );
            StageOutcome::Fail { error, outputs }
        }
    }
}

/// Parallel: named branches run concurrently up to max_workers.
pub async fn run_parallel(
    scope: &ExecScope,
    iden: &str,
    branches: &indexmap::IndexMap<String, Vec<Stage>>,
    max_workers: usize,
    ctx: &Value,
) -> StageOutcome {
    let semaphore = Arc::new(Semaphore::new(max_workers));
    let mut tasks: JoinSet<(String, StageListRun)> = JoinSet::new();

    for (name, stages) in branches {
        let scope = scope.clone();
        let name = name.clone();
        let stages = stages.clone();
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let run = run_stage_list(&scope, &stages, &ctx).await;
            (name, run)
        });
    }

    let mut children = Map::new();
    let mut statuses = Vec::with_capacity(branches.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, run)) => {
                statuses.push(run.status);
                children.insert(name, run.into_context());
            }
            Err(err) => {
                statuses.push(Status::Failed);
                scope.tracer.error("parallel branch panicked", Some(err.to_string()));
            }
        }
    }

    // Re-key in declaration order for a stable context
    let mut ordered = Map::new();
    for name in branches.keys() {
        if let Some(child) = children.remove(name.as_str()) {
            ordered.insert(name.clone(), child);
        }
    }

    nested_outcome(iden, "branches", ordered, statuses, scope.token.is_cancelled())
}

/// ForEach: inner stages once per item of the rendered sequence.
#[allow(clippy::too_many_arguments)]
pub async fn run_foreach(
    scope: &ExecScope,
    iden: &str,
    foreach: &Value,
    stages: &[Stage],
    concurrent: usize,
    use_index_as_key: bool,
    ctx: &Value,
) -> StageOutcome {
    let rendered = match scope.runtime.template.render(foreach, ctx) {
        Ok(v) => v,
        Err(err) => return StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
    };
    let Some(items) = rendered.as_array().cloned() else {
        return StageOutcome::fail(ErrorRecord::stage(
            iden,
            format!("foreach rendered to {rendered}, expected a sequence"),
        ));
    };

    // Stable keys: the item's string form, or the index when requested;
    // colliding string forms fall back to a suffixed key.
    let mut keys: Vec<String> = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let key = if use_index_as_key {
            index.to_string()
        } else {
            let base = to_display_string(item);
            if keys.contains(&base) {
                format!("{base}-{index}")
            } else {
                base
            }
        };
        keys.push(key);
    }

    let semaphore = Arc::new(Semaphore::new(concurrent));
    let mut tasks: JoinSet<(usize, StageListRun)> = JoinSet::new();
    for (index, item) in items.iter().enumerate() {
        let scope = scope.clone();
        let stages = stages.to_vec();
        let semaphore = semaphore.clone();
        let mut item_ctx = ctx.clone();
        if let Some(map) = item_ctx.as_object_mut() {
            map.insert("item".to_string(), item.clone());
            if use_index_as_key {
                map.insert("loop".to_string(), json!(index));
            }
        }
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let run = run_stage_list(&scope, &stages, &item_ctx).await;
            (index, run)
        });
    }

    let mut runs: Vec<Option<StageListRun>> = (0..items.len()).map(|_| None).collect();
    let mut statuses = Vec::with_capacity(items.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, run)) => {
                statuses.push(run.status);
                runs[index] = Some(run);
            }
            Err(err) => {
                statuses.push(Status::Failed);
                scope.tracer.error("foreach item panicked", Some(err.to_string()));
            }
        }
    }

    let mut children = Map::new();
    for (index, run) in runs.into_iter().enumerate() {
        if let Some(run) = run {
            children.insert(keys[index].clone(), run.into_context());
        }
    }

    nested_outcome(iden, "items", children, statuses, scope.token.is_cancelled())
}

/// Until: run the stage list, fold `item` updates out of the pass outputs,
/// then evaluate the `until` expression against the updated context. The
/// loop is bounded by max_loop; exhausting the bound is a failure.
pub async fn run_until(
    scope: &ExecScope,
    iden: &str,
    initial: &Value,
    until: &str,
    stages: &[Stage],
    max_loop: u32,
    ctx: &Value,
) -> StageOutcome {
    let mut item = match scope.runtime.template.render(initial, ctx) {
        Ok(v) => v,
        Err(err) => return StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
    };

    for pass in 0..max_loop {
        if scope.token.is_cancelled() {
            return StageOutcome::Cancel;
        }
        let mut loop_ctx = ctx.clone();
        if let Some(map) = loop_ctx.as_object_mut() {
            map.insert("item".to_string(), item.clone());
            map.insert("loop".to_string(), json!(pass));
        }

        let run = run_stage_list(scope, stages, &loop_ctx).await;
        match run.status {
            Status::Failed => {
                let error = ErrorRecord::stage(iden, format!("until pass {pass} failed"));
                let mut outputs = Map::new();
                outputs.insert("item".to_string(), item);
                outputs.insert("loop".to_string(), json!(pass));
                return StageOutcome::Fail { error, outputs };
            }
            Status::Cancel => return StageOutcome::Cancel,
            _ => {}
        }

        // Inner stages update the loop variable by exporting an `item`
        // output; the last writer in the pass wins.
        for slot in run.stages.values() {
            if let Some(next) = slot.get("outputs").and_then(|o| o.get("item")) {
                item = next.clone();
            }
        }

        let mut eval_ctx = loop_ctx;
        if let Some(map) = eval_ctx.as_object_mut() {
            map.insert("item".to_string(), item.clone());
            map.insert(
                "stages".to_string(),
                Value::Object(run.stages.clone()),
            );
        }
        match super::evaluate_condition(&scope.runtime.template, until, &eval_ctx) {
            Ok(true) => {
                let mut outputs = Map::new();
                outputs.insert("item".to_string(), item);
                outputs.insert("loop".to_string(), json!(pass + 1));
                return StageOutcome::Success(outputs);
            }
            Ok(false) => {}
            Err(err) => {
                return StageOutcome::fail(ErrorRecord::stage(
                    iden,
                    format!("until expression failed: {err}"),
                ))
            }
        }
    }

    let error = ErrorRecord::stage(
        iden,
        format!("until condition not met within max_loop ({max_loop})"),
    );
    let mut outputs = Map::new();
    outputs.insert("item".to_string(), item);
    outputs.insert("loop".to_string(), json!(max_loop));
    StageOutcome::Fail { error, outputs }
}

/// Case: compare the rendered expression's string form against each arm;
/// first match wins, `_` is the fallback.
pub async fn run_case(
    scope: &ExecScope,
    iden: &str,
    case: &str,
    arms: &[CaseMatch],
    skip_not_match: bool,
    ctx: &Value,
) -> StageOutcome {
    let rendered = match scope.runtime.template.render_str(case, ctx) {
        Ok(v) => to_display_string(&v),
        Err(err) => return StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
    };

    let arm = arms
        .iter()
        .find(|arm| arm.case == rendered)
        .or_else(|| arms.iter().find(|arm| arm.case == "_"));

    let Some(arm) = arm else {
        if skip_not_match {
            return StageOutcome::Skip;
        }
        return StageOutcome::fail(ErrorRecord::stage(
            iden,
            format!("no case arm matches {rendered:?}"),
        ));
    };

    let run = run_stage_list(scope, &arm.stages, ctx).await;
    let status = run.status;
    let mut outputs = Map::new();
    outputs.insert("case".to_string(), json!(arm.case));
    outputs.insert("stages".to_string(), Value::Object(run.stages));

    match status {
        Status::Success | Status::Skip => StageOutcome::Success(outputs),
        Status::Cancel => StageOutcome::Cancel,
        _ => {
            let error = ErrorRecord::stage(iden, format!("case arm {:?} failed", arm.case));
            StageOutcome::Fail { error, outputs }
        }
    }
}
