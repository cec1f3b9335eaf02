// Script stages and expression evaluation
//
// Conditions, `until` expressions and the script stage variants all run on
// rhai. The engine is sandboxed: only the standard packages are registered,
// so scripts have no filesystem or process-execution primitives, and hard
// limits bound runaway scripts. Virtual scripts get a fresh engine on the
// blocking pool; the isolated environment is the engine instance.

use indexmap::IndexMap;
use rhai::{Dynamic, Engine, Scope};
use serde_json::{Map, Value};

use cadence_core::{CoreError, Result};

/// Operation budget for condition expressions.
const EXPR_MAX_OPERATIONS: u64 = 100_000;

/// Operation budget for script stages.
const SCRIPT_MAX_OPERATIONS: u64 = 10_000_000;

fn sandbox_engine(max_operations: u64) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.set_max_call_levels(32);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(10_000);
    engine
}

/// Convert a JSON value into a rhai value.
pub fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from_int(i)
            } else {
                Dynamic::from_float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(seq) => {
            let arr: rhai::Array = seq.iter().map(value_to_dynamic).collect();
            arr.into()
        }
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (k, v) in map {
                out.insert(k.as_str().into(), value_to_dynamic(v));
            }
            out.into()
        }
    }
}

/// Convert a rhai value back into JSON.
pub fn dynamic_to_value(value: Dynamic) -> Value {
    if value.is::<()>() {
        Value::Null
    } else if let Some(b) = value.clone().try_cast::<bool>() {
        Value::Bool(b)
    } else if let Some(i) = value.clone().try_cast::<rhai::INT>() {
        Value::from(i)
    } else if let Some(f) = value.clone().try_cast::<rhai::FLOAT>() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(s) = value.clone().try_cast::<rhai::ImmutableString>() {
        Value::String(s.to_string())
    } else if let Some(seq) = value.clone().try_cast::<rhai::Array>() {
        Value::Array(seq.into_iter().map(dynamic_to_value).collect())
    } else if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut out = Map::new();
        for (k, v) in map {
            out.insert(k.to_string(), dynamic_to_value(v));
        }
        Value::Object(out)
    } else {
        // Opaque host types stringify; scripts cannot create them anyway
        Value::String(value.to_string())
    }
}

/// Evaluate a rendered boolean expression, e.g. a condition or an `until`.
pub fn eval_bool_expr(expr: &str) -> Result<bool> {
    let engine = sandbox_engine(EXPR_MAX_OPERATIONS);
    let out = engine
        .eval_expression::<Dynamic>(expr.trim())
        .map_err(|e| CoreError::stage(format!("expression {expr:?} failed: {e}")))?;
    out.as_bool()
        .map_err(|ty| CoreError::stage(format!("expression {expr:?} evaluated to {ty}, expected bool")))
}

/// Run a script with `vars` pre-populated, capturing every exported
/// top-level name as an output.
pub fn run_script(source: &str, vars: &IndexMap<String, Value>) -> Result<Map<String, Value>> {
    let engine = sandbox_engine(SCRIPT_MAX_OPERATIONS);
    let mut scope = Scope::new();
    for (name, value) in vars {
        scope.push_dynamic(name.as_str(), value_to_dynamic(value));
    }
    engine
        .run_with_scope(&mut scope, source)
        .map_err(|e| CoreError::stage(format!("script failed: {e}")))?;

    let mut outputs = Map::new();
    for (name, _constant, value) in scope.iter() {
        outputs.insert(name.to_string(), dynamic_to_value(value));
    }
    Ok(outputs)
}

/// Run a virtual script on the blocking pool in a fresh engine. `version`
/// and `deps` pin the environment; resolution beyond the engine instance is
/// a runner concern.
pub async fn run_virtual_script(
    source: &str,
    vars: &IndexMap<String, Value>,
    version: Option<&str>,
    deps: &[String],
) -> Result<Map<String, Value>> {
    tracing::debug!(
        version = version.unwrap_or("default"),
        deps = deps.len(),
        "running virtual script in isolated engine"
    );
    let source = source.to_string();
    let vars = vars.clone();
    tokio::task::spawn_blocking(move || run_script(&source, &vars))
        .await
        .map_err(|e| CoreError::stage(format!("virtual script join: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bool_expressions() {
        assert!(eval_bool_expr("true").unwrap());
        assert!(!eval_bool_expr("false").unwrap());
        assert!(eval_bool_expr("4 >= 2").unwrap());
        assert!(!eval_bool_expr("10 >= 100").unwrap());
        assert!(eval_bool_expr("\"a\" == \"a\"").unwrap());
        // Non-boolean results are an error, not truthiness
        assert!(eval_bool_expr("1 + 1").is_err());
        assert!(eval_bool_expr("nonsense ===").is_err());
    }

    #[test]
    fn scripts_export_top_level_names() {
        let mut vars = IndexMap::new();
        vars.insert("base".to_string(), json!(40));
        let out = run_script("let total = base + 2; let name = \"done\";", &vars).unwrap();
        assert_eq!(out["total"], json!(42));
        assert_eq!(out["name"], json!("done"));
        assert_eq!(out["base"], json!(40));
    }

    #[test]
    fn script_failure_is_an_error() {
        assert!(run_script("undefined_fn();", &IndexMap::new()).is_err());
    }

    #[test]
    fn runaway_scripts_hit_the_operation_budget() {
        let err = run_script("let x = 0; loop { x += 1; }", &IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("script failed"));
    }

    #[test]
    fn value_conversion_roundtrip() {
        let original = json!({
            "n": 1,
            "f": 1.5,
            "s": "text",
            "b": true,
            "nothing": null,
            "seq": [1, "two", {"k": 3}],
        });
        let back = dynamic_to_value(value_to_dynamic(&original));
        assert_eq!(back, original);
    }

    #[tokio::test]
    async fn virtual_script_runs_isolated() {
        let mut vars = IndexMap::new();
        vars.insert("n".to_string(), json!(3));
        let out = run_virtual_script("let sq = n * n;", &vars, Some("1.2"), &[])
            .await
            .unwrap();
        assert_eq!(out["sq"], json!(9));
    }
}
