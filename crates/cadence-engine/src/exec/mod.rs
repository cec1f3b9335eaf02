// Stage executor
//
// One outer function owns the pre-execution protocol shared by every
// variant: cancellation check, condition (skip when it evaluates to true),
// cancellable sleep, then dispatch by tag with the retry discipline around
// the dispatch. Nested variants compose back into execute_stage through the
// sub-executors in `nested`.

pub mod call;
pub mod nested;
pub mod script;
pub mod shell;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use cadence_core::{
    template::to_display_string, CoreError, ErrorRecord, Result, Stage, StageAction,
    TemplateEngine,
};

use crate::outcome::StageOutcome;
use crate::runtime::ExecScope;

/// Evaluate a condition expression against the context. The stage (or job)
/// is skipped when the rendered expression evaluates to the literal `true`.
pub fn evaluate_condition(template: &TemplateEngine, condition: &str, ctx: &Value) -> Result<bool> {
    match template.render_str(condition, ctx)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) => script::eval_bool_expr(&s),
        other => Err(CoreError::stage(format!(
            "condition {condition:?} rendered to {other}, expected a boolean expression"
        ))),
    }
}

fn render_string(template: &TemplateEngine, raw: &str, ctx: &Value) -> Result<String> {
    template.render_str(raw, ctx).map(|v| to_display_string(&v))
}

fn render_map(
    template: &TemplateEngine,
    raw: &IndexMap<String, Value>,
    ctx: &Value,
) -> Result<Map<String, Value>> {
    let mut out = Map::with_capacity(raw.len());
    for (key, value) in raw {
        out.insert(key.clone(), template.render(value, ctx)?);
    }
    Ok(out)
}

fn render_env(
    template: &TemplateEngine,
    raw: &IndexMap<String, String>,
    ctx: &Value,
) -> Result<IndexMap<String, String>> {
    let mut out = IndexMap::with_capacity(raw.len());
    for (key, value) in raw {
        out.insert(key.clone(), render_string(template, value, ctx)?);
    }
    Ok(out)
}

fn render_vars(
    template: &TemplateEngine,
    raw: &IndexMap<String, Value>,
    ctx: &Value,
) -> Result<IndexMap<String, Value>> {
    let mut out = IndexMap::with_capacity(raw.len());
    for (key, value) in raw {
        out.insert(key.clone(), template.render(value, ctx)?);
    }
    Ok(out)
}

/// Execute one stage against a context snapshot. Boxed so nested variants
/// can recurse.
pub fn execute_stage<'a>(
    scope: &'a ExecScope,
    stage: &'a Stage,
    ctx: &'a Value,
) -> BoxFuture<'a, StageOutcome> {
    async move {
        let iden = stage.iden().unwrap_or("stage");
        let tracer = scope.tracer.with_stage(iden);
        let template = &scope.runtime.template;

        if scope.token.is_cancelled() {
            return StageOutcome::Cancel;
        }

        if let Some(condition) = &stage.common.condition {
            match evaluate_condition(template, condition, ctx) {
                Ok(true) => {
                    tracer.info("skipped by condition");
                    return StageOutcome::Skip;
                }
                Ok(false) => {}
                Err(err) => {
                    let record = ErrorRecord::stage(iden, err.to_string());
                    tracer.error("condition evaluation failed", Some(record.message.clone()));
                    return StageOutcome::fail(record);
                }
            }
        }

        if stage.common.sleep > 0.0 {
            let pause = Duration::from_secs_f64(stage.common.sleep);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = scope.token.cancelled() => return StageOutcome::Cancel,
            }
        }

        let started = Instant::now();
        tracer.info(format!("execute {} stage", stage.action.kind()));

        let mut attempt = 0u32;
        let outcome = loop {
            let outcome = dispatch(scope, stage, iden, ctx).await;
            let retryable =
                matches!(outcome, StageOutcome::Fail { .. }) && attempt < stage.common.retry;
            if !retryable {
                break outcome;
            }
            attempt += 1;
            if let StageOutcome::Fail { error, .. } = &outcome {
                tracer.warn(format!(
                    "attempt {attempt}/{} failed: {}",
                    stage.common.retry + 1,
                    error.message
                ));
            }
            // Prior attempt's outputs are discarded by looping
            tokio::select! {
                _ = tokio::time::sleep(scope.runtime.config.retry_delay) => {}
                _ = scope.token.cancelled() => break StageOutcome::Cancel,
            }
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match &outcome {
            StageOutcome::Fail { error, .. } => {
                tracer.error(format!("stage failed after {elapsed}ms"), Some(error.message.clone()))
            }
            StageOutcome::Cancel => tracer.warn("stage cancelled"),
            _ => tracer.done(format!("stage {}", outcome.status()), elapsed),
        }
        outcome
    }
    .boxed()
}

async fn dispatch(scope: &ExecScope, stage: &Stage, iden: &str, ctx: &Value) -> StageOutcome {
    let template = &scope.runtime.template;
    let tracer = scope.tracer.with_stage(iden);

    match &stage.action {
        StageAction::Empty { echo } => {
            if let Some(echo) = echo {
                match render_string(template, echo, ctx) {
                    Ok(message) => tracer.info(message),
                    Err(err) => return StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
                }
            }
            StageOutcome::Success(Map::new())
        }

        StageAction::Bash { bash, env } => {
            let bash = match render_string(template, bash, ctx) {
                Ok(bash) => bash,
                Err(err) => return StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
            };
            let env = match render_env(template, env, ctx) {
                Ok(env) => env,
                Err(err) => return StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
            };
            shell::run_bash(iden, &bash, &env, &scope.token, scope.runtime.config.grace_period)
                .await
        }

        StageAction::Script { run, vars } => {
            let prepared = render_string(template, run, ctx)
                .and_then(|source| Ok((source, render_vars(template, vars, ctx)?)));
            match prepared {
                Ok((source, vars)) => match script::run_script(&source, &vars) {
                    Ok(outputs) => StageOutcome::Success(outputs),
                    Err(err) => StageOutcome::fail(err.into_record(iden)),
                },
                Err(err) => StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
            }
        }

        StageAction::VirtualScript { run, vars, version, deps } => {
            let prepared = render_string(template, run, ctx)
                .and_then(|source| Ok((source, render_vars(template, vars, ctx)?)));
            match prepared {
                Ok((source, vars)) => {
                    match script::run_virtual_script(&source, &vars, version.as_deref(), deps).await
                    {
                        Ok(outputs) => StageOutcome::Success(outputs),
                        Err(err) => StageOutcome::fail(err.into_record(iden)),
                    }
                }
                Err(err) => StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
            }
        }

        StageAction::Call { uses, args } => {
            let prepared = render_string(template, uses, ctx)
                .and_then(|reference| Ok((reference, render_map(template, args, ctx)?)));
            match prepared {
                Ok((reference, args)) => call::run_call(scope, iden, &reference, args).await,
                Err(err) => StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
            }
        }

        StageAction::Trigger { trigger, params } => {
            let prepared = render_string(template, trigger, ctx)
                .and_then(|name| Ok((name, render_map(template, params, ctx)?)));
            match prepared {
                Ok((name, params)) => crate::driver::run_trigger(scope, iden, &name, params).await,
                Err(err) => StageOutcome::fail(ErrorRecord::stage(iden, err.to_string())),
            }
        }

        StageAction::Raise { raise } => {
            let message = render_string(template, raise, ctx)
                .unwrap_or_else(|err| format!("{raise} (render failed: {err})"));
            StageOutcome::fail(ErrorRecord::stage(iden, message))
        }

        StageAction::Docker { image, .. } => StageOutcome::fail(ErrorRecord::stage(
            iden,
            format!("docker stage ({image}) is reserved and not executable in this build"),
        )),

        StageAction::Parallel { parallel, max_workers } => {
            nested::run_parallel(scope, iden, parallel, *max_workers, ctx).await
        }

        StageAction::ForEach { foreach, stages, concurrent, use_index_as_key } => {
            nested::run_foreach(scope, iden, foreach, stages, *concurrent, *use_index_as_key, ctx)
                .await
        }

        StageAction::Until { item, until, stages, max_loop } => {
            nested::run_until(scope, iden, item, until, stages, *max_loop, ctx).await
        }

        StageAction::Case { case, match_arms, skip_not_match } => {
            nested::run_case(scope, iden, case, match_arms, *skip_not_match, ctx).await
        }
    }
}
