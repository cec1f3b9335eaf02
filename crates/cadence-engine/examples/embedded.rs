// Embedded use of the engine: register a caller, load workflows from an
// inline YAML document and drive one release directly.
//
// Run with: cargo run --example embedded -p cadence-engine

use std::sync::Arc;

use serde_json::{json, Map, Value};

use cadence_core::{CallerRegistry, Config, FilterRegistry, MemoryStore};
use cadence_engine::{Driver, Runtime};

const WORKFLOWS: &str = r#"
daily-report:
  type: Workflow
  desc: Build and announce a tiny report.
  params:
    table: {type: str, default: sales}
    run-date: {type: datetime, default: "2024-01-01"}
  jobs:
    build:
      stages:
        - name: rows
          uses: demo/count-rows@v1
          args:
            table: "${{ params.table }}"
        - name: summary
          run: "let line = table + \": \" + rows + \" rows\";"
          vars:
            table: "${{ params.table }}"
            rows: "${{ stages.rows.outputs.rows | str }}"
    announce:
      needs: [build]
      stages:
        - name: say
          echo: "report for ${{ params.run-date }}: ${{ jobs.build.stages.summary.outputs.line }}"
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("cadence_core=info,cadence_engine=info")
        .init();

    let mut callers = CallerRegistry::new();
    callers.register(
        "demo/count-rows@v1",
        Arc::new(|args: Map<String, Value>| async move {
            let table = args.get("table").and_then(Value::as_str).unwrap_or("?");
            let mut out = Map::new();
            out.insert("rows".to_string(), json!(table.len() * 100));
            Ok(out)
        }),
    )?;

    let mut store = MemoryStore::new();
    store.insert_yaml(WORKFLOWS, "UTC")?;

    let config = Config::default();
    let runtime = Runtime::new(config, Arc::new(store), callers, FilterRegistry::with_builtins());
    let driver = Driver::new(runtime);

    let mut inputs = Map::new();
    inputs.insert("table".to_string(), json!("orders"));
    let result = driver.execute("daily-report", inputs).await?;

    println!("run {} ended {}", result.run_id, result.status);
    println!("{}", serde_json::to_string_pretty(&result.context)?);
    Ok(())
}
