// String-template interpolation over nested values
//
// The engine walks any JSON-like value and substitutes `${{ expr }}` markers
// found in string scalars. A string that is exactly one marker resolves to
// the native value of the expression; a string with surrounding text gets
// each marker rendered to its string form and concatenated.
//
// Expression grammar: `path ('|' filter('(' arg,* ')')?)*`. The path side is
// handled by the typed walker in `path`; the filter side by the registry in
// `filters`. An unresolved path is a Util error unless the chain starts with
// `coalesce`.

mod filters;
mod path;

pub use filters::{to_display_string, FilterFn, FilterRegistry};
pub use path::{Path, Segment};

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::{CoreError, Result};

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\{\s*([^{}]+?)\s*\}\}").expect("marker regex"))
}

/// Whether a string contains at least one template marker.
pub fn has_marker(s: &str) -> bool {
    marker_re().is_match(s)
}

/// One filter invocation in an expression chain.
#[derive(Debug, Clone, PartialEq)]
struct FilterCall {
    name: String,
    args: Vec<Value>,
}

/// A parsed `${{ ... }}` expression: a path plus a filter chain.
#[derive(Debug, Clone, PartialEq)]
struct Expr {
    path: Path,
    chain: Vec<FilterCall>,
}

/// Template engine: resolves markers against a context tree.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    filters: FilterRegistry,
}

impl TemplateEngine {
    pub fn new(filters: FilterRegistry) -> Self {
        Self { filters }
    }

    pub fn filters_mut(&mut self) -> &mut FilterRegistry {
        &mut self.filters
    }

    /// Recursively resolve every marker in `value` against `ctx`.
    ///
    /// Applying this to an already-resolved value (no markers) returns an
    /// equal value.
    pub fn render(&self, value: &Value, ctx: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.render_str(s, ctx),
            Value::Array(seq) => {
                let mut out = Vec::with_capacity(seq.len());
                for item in seq {
                    out.push(self.render(item, ctx)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            scalar => Ok(scalar.clone()),
        }
    }

    /// Resolve a single string scalar.
    pub fn render_str(&self, s: &str, ctx: &Value) -> Result<Value> {
        let re = marker_re();
        if !re.is_match(s) {
            return Ok(Value::String(s.to_string()));
        }

        // Whole-string placeholder: the native value passes through.
        if let Some(caps) = re.captures(s) {
            let whole = caps.get(0).expect("match");
            if whole.start() == 0 && whole.end() == s.len() {
                let expr = parse_expr(&caps[1])?;
                return self.eval(&expr, ctx);
            }
        }

        // Embedded placeholders: stringify each and concatenate.
        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in re.captures_iter(s) {
            let whole = caps.get(0).expect("match");
            out.push_str(&s[last..whole.start()]);
            let expr = parse_expr(&caps[1])?;
            let resolved = self.eval(&expr, ctx)?;
            out.push_str(&to_display_string(&resolved));
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    fn eval(&self, expr: &Expr, ctx: &Value) -> Result<Value> {
        let mut value = match expr.path.lookup(ctx) {
            Some(v) => v.clone(),
            None => {
                // A missing path only survives when the chain opens with
                // coalesce; the absent value is modeled as null.
                let opens_with_coalesce =
                    expr.chain.first().map(|f| f.name == "coalesce").unwrap_or(false);
                if opens_with_coalesce {
                    Value::Null
                } else {
                    return Err(CoreError::template(format!(
                        "cannot resolve path {:?}",
                        expr.path.to_string()
                    )));
                }
            }
        };
        for call in &expr.chain {
            value = self.filters.apply(&call.name, &value, &call.args)?;
        }
        Ok(value)
    }
}

/// Split an expression on `|` at depth zero, outside quotes.
fn split_chain(raw: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| CoreError::template(format!("unbalanced parens in {raw:?}")))?;
            }
            (None, '|') if depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(CoreError::template(format!("unbalanced expression {raw:?}")));
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

fn parse_expr(raw: &str) -> Result<Expr> {
    let parts = split_chain(raw)?;
    let (head, tail) = parts.split_first().expect("split_chain is non-empty");
    let path = Path::parse(head)?;
    let mut chain = Vec::with_capacity(tail.len());
    for part in tail {
        chain.push(parse_filter_call(part)?);
    }
    Ok(Expr { path, chain })
}

fn parse_filter_call(raw: &str) -> Result<FilterCall> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CoreError::template("empty filter in chain"));
    }
    let (name, args) = match raw.find('(') {
        None => (raw, Vec::new()),
        Some(open) => {
            if !raw.ends_with(')') {
                return Err(CoreError::template(format!("malformed filter call {raw:?}")));
            }
            let name = &raw[..open];
            let inner = &raw[open + 1..raw.len() - 1];
            (name, parse_args(inner)?)
        }
    };
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CoreError::template(format!("invalid filter name {name:?}")));
    }
    Ok(FilterCall { name: name.to_string(), args })
}

fn parse_args(inner: &str) -> Result<Vec<Value>> {
    let inner = inner.trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut spans = Vec::new();
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ',') => {
                spans.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    spans.push(&inner[start..]);
    for span in spans {
        args.push(parse_literal(span.trim())?);
    }
    Ok(args)
}

/// Filter arguments are literals only: quoted strings, ints, floats, bools,
/// null. Paths inside arguments are not part of the grammar.
fn parse_literal(raw: &str) -> Result<Value> {
    if raw.is_empty() {
        return Err(CoreError::template("empty filter argument"));
    }
    if (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
        || (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Ok(Value::from(f));
    }
    Err(CoreError::template(format!("invalid filter argument {raw:?}")))
}
