// Workflow input declarations
//
// A workflow declares its inputs as a mapping from name to a typed spec.
// Validation is table-driven over the closed set of variants; coercion is
// idempotent so a value can safely pass through twice (release, rerun).

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// Declared type of one workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamType {
    Str,
    Int,
    Date,
    Datetime,
    Choice {
        options: Vec<Value>,
    },
    Map,
    Array,
}

/// Full parameter spec: a type plus an optional default and description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    #[serde(flatten)]
    pub ty: ParamType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// When absent, a param is required iff it carries no default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl ParamSpec {
    pub fn of(ty: ParamType) -> Self {
        Self { ty, default: None, desc: None, required: None }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }

    /// Coerce an input value to this spec's type. Idempotent.
    pub fn coerce(&self, name: &str, value: &Value) -> Result<Value> {
        match &self.ty {
            ParamType::Str => coerce_str(name, value),
            ParamType::Int => coerce_int(name, value),
            ParamType::Date => coerce_date(name, value),
            ParamType::Datetime => coerce_datetime(name, value),
            ParamType::Choice { options } => {
                if options.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(CoreError::param(format!(
                        "param {name:?}: value {value} is not one of the declared options"
                    )))
                }
            }
            ParamType::Map => {
                if value.is_object() {
                    Ok(value.clone())
                } else {
                    Err(CoreError::param(format!("param {name:?}: expected a mapping")))
                }
            }
            ParamType::Array => {
                if value.is_array() {
                    Ok(value.clone())
                } else {
                    Err(CoreError::param(format!("param {name:?}: expected a sequence")))
                }
            }
        }
    }

    /// The value used when the caller passes nothing: the coerced default,
    /// or the first option for a choice param.
    fn default_value(&self, name: &str) -> Result<Option<Value>> {
        if let Some(dft) = &self.default {
            return self.coerce(name, dft).map(Some);
        }
        if let ParamType::Choice { options } = &self.ty {
            return Ok(options.first().cloned());
        }
        Ok(None)
    }
}

// Shorthand `name: str` and the full `name: {type: str, ...}` form both load.
impl<'de> Deserialize<'de> for ParamSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Shorthand(String),
            Full {
                #[serde(flatten)]
                ty: ParamType,
                #[serde(default)]
                default: Option<Value>,
                #[serde(default)]
                desc: Option<String>,
                #[serde(default)]
                required: Option<bool>,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Shorthand(name) => {
                let ty = match name.as_str() {
                    "str" => ParamType::Str,
                    "int" => ParamType::Int,
                    "date" => ParamType::Date,
                    "datetime" => ParamType::Datetime,
                    "map" => ParamType::Map,
                    "array" => ParamType::Array,
                    other => {
                        return Err(de::Error::custom(format!(
                            "unknown param type {other:?}"
                        )))
                    }
                };
                Ok(ParamSpec::of(ty))
            }
            Raw::Full { ty, default, desc, required } => {
                Ok(ParamSpec { ty, default, desc, required })
            }
        }
    }
}

fn coerce_str(_name: &str, value: &Value) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(s.clone()),
        Value::Null => Value::Null,
        other => Value::String(crate::template::to_display_string(other)),
    })
}

fn coerce_int(name: &str, value: &Value) -> Result<Value> {
    match value {
        Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| CoreError::param(format!("param {name:?}: {s:?} is not an integer"))),
        other => Err(CoreError::param(format!(
            "param {name:?}: {other} is not an integer"
        ))),
    }
}

/// Dates normalize to `YYYY-MM-DD`; a datetime input keeps its date part.
fn coerce_date(name: &str, value: &Value) -> Result<Value> {
    let s = value
        .as_str()
        .ok_or_else(|| CoreError::param(format!("param {name:?}: expected a date string")))?;
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Value::String(d.format("%Y-%m-%d").to_string()));
    }
    if let Ok(dt) = parse_naive_datetime(s) {
        return Ok(Value::String(dt.date().format("%Y-%m-%d").to_string()));
    }
    Err(CoreError::param(format!(
        "param {name:?}: {s:?} does not parse as an ISO-8601 date"
    )))
}

/// Datetimes normalize to `YYYY-MM-DDTHH:MM:SS`; a bare date becomes midnight.
fn coerce_datetime(name: &str, value: &Value) -> Result<Value> {
    let s = value
        .as_str()
        .ok_or_else(|| CoreError::param(format!("param {name:?}: expected a datetime string")))?;
    if let Ok(dt) = parse_naive_datetime(s) {
        return Ok(Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let dt = d.and_hms_opt(0, 0, 0).expect("midnight");
        return Ok(Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()));
    }
    Err(CoreError::param(format!(
        "param {name:?}: {s:?} does not parse as an ISO-8601 datetime"
    )))
}

fn parse_naive_datetime(s: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| {
            chrono::DateTime::parse_from_rfc3339(s).map(|dt| dt.naive_utc())
        })
}

/// Validate caller inputs against the declared params, producing the resolved
/// `params` mapping in declaration order. Undeclared inputs are dropped.
pub fn validate_inputs(
    specs: &IndexMap<String, ParamSpec>,
    inputs: &Map<String, Value>,
) -> Result<Value> {
    let mut out = Map::with_capacity(specs.len());
    for (name, spec) in specs {
        match inputs.get(name) {
            Some(value) => {
                out.insert(name.clone(), spec.coerce(name, value)?);
            }
            None => match spec.default_value(name)? {
                Some(dft) => {
                    out.insert(name.clone(), dft);
                }
                None if spec.is_required() => {
                    return Err(CoreError::param(format!(
                        "missing required param {name:?}"
                    )));
                }
                None => {
                    out.insert(name.clone(), Value::Null);
                }
            },
        }
    }
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs(yaml: &str) -> IndexMap<String, ParamSpec> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn shorthand_and_full_forms_load() {
        let specs = specs(
            r#"
            name: str
            run-date: {type: datetime, default: "2024-01-01"}
            mode: {type: choice, options: [full, delta]}
            "#,
        );
        assert_eq!(specs["name"].ty, ParamType::Str);
        assert!(specs["run-date"].default.is_some());
        assert!(matches!(specs["mode"].ty, ParamType::Choice { .. }));
    }

    #[test]
    fn missing_required_is_a_param_error() {
        let specs = specs("name: str");
        let err = validate_inputs(&specs, &Map::new()).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn defaults_fill_absent_inputs() {
        let specs = specs(
            r#"
            count: {type: int, default: "5"}
            mode: {type: choice, options: [full, delta]}
            "#,
        );
        let out = validate_inputs(&specs, &Map::new()).unwrap();
        assert_eq!(out, json!({"count": 5, "mode": "full"}));
    }

    #[test]
    fn datetime_round_trips_iso8601() {
        let spec = ParamSpec::of(ParamType::Datetime);
        let once = spec.coerce("d", &json!("2024-03-09")).unwrap();
        assert_eq!(once, json!("2024-03-09T00:00:00"));
        let twice = spec.coerce("d", &once).unwrap();
        assert_eq!(once, twice);

        let rfc = spec.coerce("d", &json!("2024-03-09T10:30:00+00:00")).unwrap();
        assert_eq!(rfc, json!("2024-03-09T10:30:00"));
    }

    #[test]
    fn date_keeps_date_part_of_datetime() {
        let spec = ParamSpec::of(ParamType::Date);
        assert_eq!(
            spec.coerce("d", &json!("2024-03-09T10:30:00")).unwrap(),
            json!("2024-03-09")
        );
        assert!(spec.coerce("d", &json!("not-a-date")).is_err());
    }

    #[test]
    fn choice_rejects_values_outside_options() {
        let spec = ParamSpec::of(ParamType::Choice { options: vec![json!("a"), json!("b")] });
        assert!(spec.coerce("m", &json!("c")).is_err());
        assert_eq!(spec.coerce("m", &json!("b")).unwrap(), json!("b"));
    }

    #[test]
    fn coercion_is_idempotent() {
        let cases = [
            (ParamSpec::of(ParamType::Str), json!(12)),
            (ParamSpec::of(ParamType::Int), json!("42")),
            (ParamSpec::of(ParamType::Date), json!("2024-05-06T01:02:03")),
            (ParamSpec::of(ParamType::Datetime), json!("2024-05-06")),
        ];
        for (spec, input) in cases {
            let once = spec.coerce("p", &input).unwrap();
            let twice = spec.coerce("p", &once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn undeclared_inputs_are_dropped() {
        let specs = specs("name: {type: str, default: x}");
        let mut inputs = Map::new();
        inputs.insert("other".to_string(), json!(1));
        let out = validate_inputs(&specs, &inputs).unwrap();
        assert_eq!(out, json!({"name": "x"}));
    }
}
