// End-to-end scenarios for the execution engine, driven through the driver
// against an in-memory workflow store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use cadence_core::{
    CallerRegistry, Config, CoreError, FilterRegistry, MemoryStore, RunResult, Status,
};
use cadence_engine::{Driver, Runtime};

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.trace_enabled = false;
    config.audit_enabled = false;
    config.retry_delay = Duration::from_millis(20);
    config
}

fn driver_for(yaml: &str, config: Config, callers: CallerRegistry) -> Driver {
    let mut store = MemoryStore::new();
    store.insert_yaml(yaml, "UTC").expect("workflows load");
    let runtime = Runtime::new(config, Arc::new(store), callers, FilterRegistry::with_builtins());
    Driver::new(runtime)
}

async fn run(yaml: &str, name: &str) -> RunResult {
    driver_for(yaml, quiet_config(), CallerRegistry::new())
        .execute(name, Map::new())
        .await
        .expect("execution starts")
}

fn at<'a>(result: &'a RunResult, pointer: &str) -> &'a Value {
    result
        .context
        .pointer(pointer)
        .unwrap_or_else(|| panic!("missing {pointer} in {}", result.context))
}

// S1: one job, one empty stage.
#[tokio::test]
async fn s1_trivial_success() {
    let result = run(
        r#"
        s1:
          type: Workflow
          jobs:
            first:
              stages:
                - name: first
                  echo: hi
        "#,
        "s1",
    )
    .await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(at(&result, "/jobs/first/stages/first/outputs"), &json!({}));
    assert_eq!(at(&result, "/jobs/first/status"), &json!("SUCCESS"));
    assert!(result.errors.is_empty());
}

// S2: a job skipped by its condition propagates SKIP through all_success.
#[tokio::test]
async fn s2_skip_propagation() {
    let result = run(
        r#"
        s2:
          type: Workflow
          jobs:
            a:
              stages: [{name: seed, echo: hi}]
            b:
              needs: [a]
              if: "true"
              stages: [{name: work, echo: working}]
            c:
              needs: [b]
              stages: [{name: after, echo: done}]
        "#,
        "s2",
    )
    .await;
    assert_eq!(at(&result, "/jobs/a/status"), &json!("SUCCESS"));
    assert_eq!(at(&result, "/jobs/b/status"), &json!("SKIP"));
    // all_success over a SKIP terminal settles downstream as SKIP
    assert_eq!(at(&result, "/jobs/c/status"), &json!("SKIP"));
    assert_eq!(result.status, Status::Success);
}

// S3: matrix with exclusion and include expands to exactly six strategies.
#[tokio::test]
async fn s3_matrix_exclude_include() {
    let result = run(
        r#"
        s3:
          type: Workflow
          jobs:
            fan:
              strategy:
                matrix:
                  table: [a, b]
                  part: [1, 2, 3]
                exclude:
                  - {table: a, part: 1}
                include:
                  - {table: c, part: 4}
                max_parallel: 2
                fail_fast: false
              stages:
                - name: touch
                  echo: "${{ matrix.table }}-${{ matrix.part }}"
        "#,
        "s3",
    )
    .await;
    assert_eq!(result.status, Status::Success);
    let strategies = at(&result, "/jobs/fan/strategies").as_object().unwrap();
    assert_eq!(strategies.len(), 6);
    let tables: Vec<&str> = strategies
        .values()
        .map(|pass| pass.pointer("/matrix/table").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(tables.iter().filter(|t| **t == "c").count(), 1);
    for pass in strategies.values() {
        assert_eq!(pass["status"], json!("SUCCESS"));
    }
}

// S4: foreach with one failing item; the others still complete.
#[tokio::test]
async fn s4_foreach_with_one_failure() {
    let result = run(
        r#"
        s4:
          type: Workflow
          jobs:
            sweep:
              stages:
                - name: spread
                  foreach: [1, 2, 3, 4]
                  concurrent: 2
                  stages:
                    - name: work
                      if: "${{ item }} != 3"
                      raise: "boom at ${{ item }}"
        "#,
        "s4",
    )
    .await;
    assert_eq!(result.status, Status::Failed);
    assert_eq!(at(&result, "/jobs/sweep/status"), &json!("FAILED"));
    let slot = at(&result, "/jobs/sweep/stages/spread");
    assert_eq!(slot["status"], json!("FAILED"));
    let items = slot.pointer("/outputs/items").unwrap().as_object().unwrap();
    assert_eq!(items.len(), 4);
    for ok in ["1", "2", "4"] {
        assert_eq!(items[ok]["status"], json!("SUCCESS"), "item {ok}");
    }
    assert_eq!(items["3"]["status"], json!("FAILED"));
}

// S5: until never satisfied within max_loop; the final item is observable.
#[tokio::test]
async fn s5_until_hits_the_loop_cap() {
    let result = run(
        r#"
        s5:
          type: Workflow
          jobs:
            counter:
              stages:
                - name: climb
                  item: 0
                  until: "${{ item }} >= 10"
                  max_loop: 5
                  stages:
                    - name: inc
                      run: "let item = item + 1;"
                      vars:
                        item: "${{ item }}"
        "#,
        "s5",
    )
    .await;
    assert_eq!(result.status, Status::Failed);
    let slot = at(&result, "/jobs/counter/stages/climb");
    assert_eq!(slot["status"], json!("FAILED"));
    // Exactly five passes ran, leaving the loop variable at 5
    assert_eq!(slot.pointer("/outputs/loop"), Some(&json!(5)));
    assert_eq!(slot.pointer("/outputs/item"), Some(&json!(5)));
}

// S6: driver timeout cancels the sleeping stage and classifies the release
// as FAILED with a timeout error.
#[tokio::test(start_paused = true)]
async fn s6_timeout_cancels_release() {
    let mut config = quiet_config();
    config.workflow_timeout = Duration::from_secs(2);
    let driver = driver_for(
        r#"
        s6:
          type: Workflow
          jobs:
            slow:
              stages:
                - name: nap
                  sleep: 60
                  echo: never-reached
        "#,
        config,
        CallerRegistry::new(),
    );
    let started = tokio::time::Instant::now();
    let result = driver.execute("s6", Map::new()).await.unwrap();
    assert_eq!(result.status, Status::Failed);
    assert_eq!(at(&result, "/jobs/slow/stages/nap/status"), &json!("CANCEL"));
    let timeout_errors: Vec<_> = result
        .errors
        .iter()
        .filter(|e| e.message.contains("timeout"))
        .collect();
    assert_eq!(timeout_errors.len(), 1);
    assert_eq!(result.exit_code(), 2);
    // Well inside timeout + grace even in virtual time
    assert!(started.elapsed() < Duration::from_secs(7));
}

// S7: trigger stage surfaces the child's failure with its run_id.
#[tokio::test]
async fn s7_trigger_child_failure() {
    let result = run(
        r#"
        parent-wf:
          type: Workflow
          jobs:
            main:
              stages:
                - name: fire
                  trigger: child-wf
        child-wf:
          type: Workflow
          jobs:
            boom:
              stages:
                - name: kaboom
                  raise: "child exploded"
        "#,
        "parent-wf",
    )
    .await;
    assert_eq!(result.status, Status::Failed);
    let slot = at(&result, "/jobs/main/stages/fire");
    assert_eq!(slot["status"], json!("FAILED"));
    let stage_error = slot["errors"][0]["message"].as_str().unwrap();
    assert!(stage_error.contains("run_id"), "got: {stage_error}");
    assert!(stage_error.contains("FAILED"));
    // The child's full context is the stage's outputs
    assert_eq!(
        slot.pointer("/outputs/jobs/boom/status"),
        Some(&json!("FAILED"))
    );
}

#[tokio::test]
async fn empty_jobs_is_success() {
    let result = run("empty:\n  type: Workflow\n  jobs: {}\n", "empty").await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(result.context["jobs"], json!({}));
}

#[tokio::test]
async fn empty_stages_is_success() {
    let result = run(
        "hollow:\n  type: Workflow\n  jobs:\n    idle: {stages: []}\n",
        "hollow",
    )
    .await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(at(&result, "/jobs/idle/status"), &json!("SUCCESS"));
}

#[tokio::test]
async fn fully_excluded_matrix_is_success() {
    let result = run(
        r#"
        excluded:
          type: Workflow
          jobs:
            none:
              strategy:
                matrix: {x: [1]}
                exclude: [{x: 1}]
              stages: [{name: never, raise: unreachable}]
        "#,
        "excluded",
    )
    .await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(at(&result, "/jobs/none/strategies"), &json!({}));
}

// max_workers = 1 forces observably sequential branches.
#[tokio::test(start_paused = true)]
async fn parallel_with_one_worker_is_sequential() {
    let yaml = r#"
        lanes:
          type: Workflow
          jobs:
            fan:
              stages:
                - name: split
                  max_workers: 1
                  parallel:
                    left:  [{name: pause, sleep: 1, echo: l}]
                    right: [{name: pause, sleep: 1, echo: r}]
        "#;
    let started = tokio::time::Instant::now();
    let result = run(yaml, "lanes").await;
    assert_eq!(result.status, Status::Success);
    assert!(started.elapsed() >= Duration::from_secs(2), "branches overlapped");

    let yaml_parallel = yaml.replace("max_workers: 1", "max_workers: 2");
    let started = tokio::time::Instant::now();
    let result = run(&yaml_parallel, "lanes").await;
    assert_eq!(result.status, Status::Success);
    assert!(started.elapsed() < Duration::from_secs(2), "branches did not overlap");
}

#[tokio::test(start_paused = true)]
async fn external_cancellation_reports_cancel() {
    let driver = driver_for(
        r#"
        stoppable:
          type: Workflow
          jobs:
            slow:
              stages: [{name: nap, sleep: 60, echo: zzz}]
        "#,
        quiet_config(),
        CallerRegistry::new(),
    );
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let result = driver
        .execute_cancellable("stoppable", Map::new(), token)
        .await
        .unwrap();
    assert_eq!(result.status, Status::Cancel);
    assert_eq!(result.exit_code(), 130);
    assert!(result.errors.iter().any(|e| e.message.contains("cancelled")));
}

// Outputs flow between stages of one job and across jobs via needs.
#[tokio::test]
async fn outputs_flow_within_and_across_jobs() {
    let result = run(
        r#"
        flow:
          type: Workflow
          jobs:
            make:
              stages:
                - name: seed
                  run: "let total = 40;"
                - name: add
                  run: "let grand = total + 2;"
                  vars:
                    total: "${{ stages.seed.outputs.total }}"
            use:
              needs: [make]
              stages:
                - name: read
                  run: "let copied = n;"
                  vars:
                    n: "${{ jobs.make.stages.add.outputs.grand }}"
        "#,
        "flow",
    )
    .await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(
        at(&result, "/jobs/use/stages/read/outputs/copied"),
        &json!(42)
    );
}

#[tokio::test]
async fn case_stage_matches_and_falls_back() {
    let yaml = r#"
        switchy:
          type: Workflow
          params:
            mode: {type: str, default: weekly}
          jobs:
            route:
              stages:
                - name: pick
                  case: "${{ params.mode }}"
                  match:
                    - case: daily
                      stages: [{name: go, echo: daily-path}]
                    - case: "_"
                      stages: [{name: go, echo: fallback-path}]
        "#;
    // Unmatched value lands on the fallback arm
    let result = run(yaml, "switchy").await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(
        at(&result, "/jobs/route/stages/pick/outputs/case"),
        &json!("_")
    );

    // A declared match wins over the fallback
    let driver = driver_for(yaml, quiet_config(), CallerRegistry::new());
    let mut inputs = Map::new();
    inputs.insert("mode".to_string(), json!("daily"));
    let result = driver.execute("switchy", inputs).await.unwrap();
    assert_eq!(
        at(&result, "/jobs/route/stages/pick/outputs/case"),
        &json!("daily")
    );
}

#[tokio::test]
async fn case_without_match_skips_when_configured() {
    let result = run(
        r#"
        no-arm:
          type: Workflow
          jobs:
            route:
              stages:
                - name: pick
                  case: "nothing"
                  skip_not_match: true
                  match:
                    - case: daily
                      stages: [{name: go, echo: daily}]
        "#,
        "no-arm",
    )
    .await;
    assert_eq!(result.status, Status::Success);
    assert_eq!(at(&result, "/jobs/route/stages/pick/status"), &json!("SKIP"));
}

fn counting_caller(counter: Arc<AtomicUsize>) -> Arc<dyn cadence_core::Caller> {
    Arc::new(move |_args: Map<String, Value>| {
        let counter = counter.clone();
        async move {
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut out = Map::new();
            out.insert("calls".to_string(), json!(seen));
            Ok(out)
        }
    })
}

fn flaky_caller(counter: Arc<AtomicUsize>) -> Arc<dyn cadence_core::Caller> {
    Arc::new(move |_args: Map<String, Value>| {
        let counter = counter.clone();
        async move {
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if seen == 1 {
                return Err(CoreError::caller("first attempt goes down"));
            }
            let mut out = Map::new();
            out.insert("calls".to_string(), json!(seen));
            Ok(out)
        }
    })
}

const RERUN_YAML: &str = r#"
rerunnable:
  type: Workflow
  jobs:
    a:
      stages: [{name: do-a, uses: tasks/count@v1}]
    b:
      needs: [a]
      stages: [{name: do-b, uses: tasks/flaky@v1}]
"#;

// Rerun replays SUCCESS jobs from prior outputs and re-executes the rest.
#[tokio::test]
async fn rerun_replays_success_and_reexecutes_failures() {
    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));
    let mut callers = CallerRegistry::new();
    callers.register("tasks/count@v1", counting_caller(count_a.clone())).unwrap();
    callers.register("tasks/flaky@v1", flaky_caller(count_b.clone())).unwrap();
    let driver = driver_for(RERUN_YAML, quiet_config(), callers);

    let first = driver.execute("rerunnable", Map::new()).await.unwrap();
    assert_eq!(first.status, Status::Failed);
    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 1);

    let second = driver
        .rerun("rerunnable", first.context.clone(), false)
        .await
        .unwrap();
    assert_eq!(second.status, Status::Success);
    // a was replayed, not re-executed; b ran again and recovered
    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 2);
    assert_eq!(at(&second, "/jobs/a/stages/do-a/outputs/calls"), &json!(1));

    // An all-SUCCESS prior context replays everything bit-for-bit
    let third = driver
        .rerun("rerunnable", second.context.clone(), false)
        .await
        .unwrap();
    assert_eq!(third.status, Status::Success);
    assert_eq!(count_a.load(Ordering::SeqCst), 1);
    assert_eq!(count_b.load(Ordering::SeqCst), 2);
    assert_eq!(third.context["jobs"], second.context["jobs"]);
}

#[tokio::test]
async fn stage_retry_discipline() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut callers = CallerRegistry::new();
    callers.register("tasks/flaky@v1", flaky_caller(count.clone())).unwrap();
    let driver = driver_for(
        r#"
        retrying:
          type: Workflow
          jobs:
            a:
              stages:
                - name: wobbly
                  retry: 2
                  uses: tasks/flaky@v1
        "#,
        quiet_config(),
        callers,
    );
    let result = driver.execute("retrying", Map::new()).await.unwrap();
    assert_eq!(result.status, Status::Success);
    // Failed once, succeeded on the first retry, second retry never needed
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(at(&result, "/jobs/a/stages/wobbly/outputs/calls"), &json!(2));
}

#[tokio::test]
async fn release_validates_schedule_and_injects_bundle() {
    let yaml = r#"
        nightly:
          type: Workflow
          on:
            - cronjob: "0 2 * * *"
          jobs:
            report:
              stages:
                - name: stamp
                  run: "let seen = 1;"
                  vars:
                    ld: "${{ params.logical_date }}"
                    rt: "${{ params.release_type }}"
        "#;
    let driver = driver_for(yaml, quiet_config(), CallerRegistry::new());

    let on_schedule = chrono::DateTime::parse_from_rfc3339("2024-05-06T02:00:45Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let result = driver.release("nightly", on_schedule, Map::new()).await.unwrap();
    assert_eq!(result.status, Status::Success);
    let outputs = at(&result, "/jobs/report/stages/stamp/outputs");
    assert_eq!(outputs["rt"], json!("schedule"));
    assert!(outputs["ld"].as_str().unwrap().starts_with("2024-05-06T02:00:00"));

    let off_schedule = on_schedule + chrono::Duration::hours(1);
    let err = driver.release("nightly", off_schedule, Map::new()).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn missing_required_param_is_an_error() {
    let driver = driver_for(
        r#"
        strict:
          type: Workflow
          params:
            who: str
          jobs:
            j: {stages: [{name: s, echo: "${{ params.who }}"}]}
        "#,
        quiet_config(),
        CallerRegistry::new(),
    );
    assert!(driver.execute("strict", Map::new()).await.is_err());

    let mut inputs = Map::new();
    inputs.insert("who".to_string(), json!("world"));
    let result = driver.execute("strict", inputs).await.unwrap();
    assert_eq!(result.status, Status::Success);
}

#[tokio::test]
async fn fail_fast_cancels_sibling_strategies() {
    let result = run(
        r#"
        ff:
          type: Workflow
          jobs:
            fan:
              strategy:
                matrix: {part: [1, 2, 3, 4]}
                max_parallel: 1
                fail_fast: true
              stages:
                - name: work
                  if: "${{ matrix.part }} != 1"
                  raise: "part one explodes"
        "#,
        "ff",
    )
    .await;
    assert_eq!(result.status, Status::Failed);
    let strategies = at(&result, "/jobs/fan/strategies").as_object().unwrap();
    let cancelled = strategies
        .values()
        .filter(|pass| pass["status"] == json!("CANCEL"))
        .count();
    let failed = strategies
        .values()
        .filter(|pass| pass["status"] == json!("FAILED"))
        .count();
    assert_eq!(failed, 1);
    // With max_parallel 1 the failure lands first and the rest get cut
    assert!(cancelled >= 1, "strategies: {strategies:?}");
}
