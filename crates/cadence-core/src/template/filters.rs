// Template filters
//
// A filter is a pure function of (value, args). The built-in set matches the
// workflow config surface; user filters are registered at load time and the
// registry is read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// A pure filter function: `(value, args) -> value`.
pub type FilterFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

/// Lookup from filter name to function. Built at load time, read-only after.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: HashMap<String, FilterFn>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.filters.keys().collect();
        names.sort();
        f.debug_struct("FilterRegistry").field("filters", &names).finish()
    }
}

impl FilterRegistry {
    /// Registry with only the built-in filters.
    pub fn with_builtins() -> Self {
        let mut reg = Self { filters: HashMap::new() };
        reg.register("abs", filter_abs);
        reg.register("str", filter_str);
        reg.register("int", filter_int);
        reg.register("upper", filter_upper);
        reg.register("lower", filter_lower);
        reg.register("title", filter_title);
        reg.register("fmt", filter_fmt);
        reg.register("coalesce", filter_coalesce);
        reg.register("getitem", filter_getitem);
        reg.register("getindex", filter_getindex);
        reg
    }

    /// Register a filter under a name. Later registrations shadow earlier ones.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&FilterFn> {
        self.filters.get(name)
    }

    /// Apply a named filter, failing with a Util error when it is unknown.
    pub fn apply(&self, name: &str, value: &Value, args: &[Value]) -> Result<Value> {
        let f = self
            .filters
            .get(name)
            .ok_or_else(|| CoreError::template(format!("unknown filter {name:?}")))?;
        f(value, args)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn no_args(name: &str, args: &[Value]) -> Result<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(CoreError::template(format!("filter {name:?} takes no arguments")))
    }
}

/// Render any value to the string form used for embedded placeholders.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn filter_abs(value: &Value, args: &[Value]) -> Result<Value> {
    no_args("abs", args)?;
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i.abs()))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::from(f.abs()))
            } else {
                Err(CoreError::template("abs: unsupported number"))
            }
        }
        other => Err(CoreError::template(format!("abs: expected number, got {other}"))),
    }
}

fn filter_str(value: &Value, args: &[Value]) -> Result<Value> {
    no_args("str", args)?;
    Ok(Value::String(to_display_string(value)))
}

fn filter_int(value: &Value, args: &[Value]) -> Result<Value> {
    no_args("int", args)?;
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::from(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::from(f as i64))
            } else {
                Err(CoreError::template("int: unsupported number"))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| CoreError::template(format!("int: cannot parse {s:?}"))),
        Value::Bool(b) => Ok(Value::from(*b as i64)),
        other => Err(CoreError::template(format!("int: cannot convert {other}"))),
    }
}

fn as_str<'v>(name: &str, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| CoreError::template(format!("{name}: expected string, got {value}")))
}

fn filter_upper(value: &Value, args: &[Value]) -> Result<Value> {
    no_args("upper", args)?;
    Ok(Value::String(as_str("upper", value)?.to_uppercase()))
}

fn filter_lower(value: &Value, args: &[Value]) -> Result<Value> {
    no_args("lower", args)?;
    Ok(Value::String(as_str("lower", value)?.to_lowercase()))
}

fn filter_title(value: &Value, args: &[Value]) -> Result<Value> {
    no_args("title", args)?;
    let s = as_str("title", value)?;
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(c.to_lowercase());
        }
    }
    Ok(Value::String(out))
}

/// `fmt(pattern)` formats a datetime (or date) value with a strftime pattern.
fn filter_fmt(value: &Value, args: &[Value]) -> Result<Value> {
    let pattern = match args {
        [Value::String(p)] => p.as_str(),
        _ => return Err(CoreError::template("fmt: expected one string argument")),
    };
    let s = as_str("fmt", value)?;
    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_rfc3339(s) {
        return Ok(Value::String(dt.format(pattern).to_string()));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Value::String(dt.format(pattern).to_string()));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Value::String(d.format(pattern).to_string()));
    }
    Err(CoreError::template(format!("fmt: {s:?} is not an ISO-8601 date or datetime")))
}

/// `coalesce(default)` substitutes the default for null. Missing paths are
/// handled earlier by the engine; by the time a filter chain runs, an absent
/// value is represented as null.
fn filter_coalesce(value: &Value, args: &[Value]) -> Result<Value> {
    let default = args
        .first()
        .ok_or_else(|| CoreError::template("coalesce: expected a default argument"))?;
    if value.is_null() {
        Ok(default.clone())
    } else {
        Ok(value.clone())
    }
}

fn filter_getitem(value: &Value, args: &[Value]) -> Result<Value> {
    let key = match args.first() {
        Some(Value::String(k)) => k.as_str(),
        _ => return Err(CoreError::template("getitem: expected a string key")),
    };
    let map = value
        .as_object()
        .ok_or_else(|| CoreError::template(format!("getitem: expected mapping, got {value}")))?;
    match (map.get(key), args.get(1)) {
        (Some(v), _) => Ok(v.clone()),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(CoreError::template(format!("getitem: missing key {key:?}"))),
    }
}

fn filter_getindex(value: &Value, args: &[Value]) -> Result<Value> {
    let idx = match args.first() {
        Some(Value::Number(n)) if n.as_u64().is_some() => n.as_u64().unwrap() as usize,
        _ => return Err(CoreError::template("getindex: expected a non-negative index")),
    };
    let seq = value
        .as_array()
        .ok_or_else(|| CoreError::template(format!("getindex: expected sequence, got {value}")))?;
    seq.get(idx)
        .cloned()
        .ok_or_else(|| CoreError::template(format!("getindex: index {idx} out of range")))
}
