// Typed path walker for template expressions
//
// A path is `segment ('.' segment)*` where a segment is either a key
// (identifier) or a non-negative integer index. Anything the parser cannot
// statically accept is rejected up front instead of being probed against the
// context at runtime.

use serde_json::Value;

use crate::error::{CoreError, Result};

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Mapping key lookup
    Key(String),
    /// Sequence index lookup (also matched against stringified mapping keys)
    Index(usize),
}

/// A parsed dotted path, e.g. `jobs.extract.stages.pull.outputs.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<Segment>,
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Path {
    /// Parse a dotted path, rejecting empty or malformed segments.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::template("empty path"));
        }
        let mut segments = Vec::new();
        for part in raw.split('.') {
            if part.is_empty() {
                return Err(CoreError::template(format!(
                    "path {raw:?} has an empty segment"
                )));
            }
            if let Ok(idx) = part.parse::<usize>() {
                segments.push(Segment::Index(idx));
            } else if is_ident(part) {
                segments.push(Segment::Key(part.to_string()));
            } else {
                return Err(CoreError::template(format!(
                    "path segment {part:?} is neither a key nor an index"
                )));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Resolve this path against a value tree. Returns None when any segment
    /// is missing; the caller decides whether that is an error.
    pub fn lookup<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut cur = root;
        for seg in &self.segments {
            cur = match (seg, cur) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Index(i), Value::Array(seq)) => seq.get(*i)?,
                // Integer segments double as stringified keys: `outputs.0`
                // works against `{"0": ...}` the same as against a list.
                (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string())?,
                _ => return None,
            };
        }
        Some(cur)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match seg {
                Segment::Key(k) => write!(f, "{k}")?,
                Segment::Index(n) => write!(f, "{n}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_keys_and_indices() {
        let path = Path::parse("jobs.j1.stages.s.outputs.0").unwrap();
        assert_eq!(path.segments().len(), 6);
        assert_eq!(path.segments()[5], Segment::Index(0));
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(Path::parse("").is_err());
        assert!(Path::parse("a..b").is_err());
        assert!(Path::parse("a.$bad").is_err());
        assert!(Path::parse("a.b[0]").is_err());
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let tree = json!({"jobs": {"j1": {"outputs": [10, 20]}}});
        let path = Path::parse("jobs.j1.outputs.1").unwrap();
        assert_eq!(path.lookup(&tree), Some(&json!(20)));
        assert!(Path::parse("jobs.missing").unwrap().lookup(&tree).is_none());
    }

    #[test]
    fn index_segment_matches_string_key() {
        let tree = json!({"items": {"0": "first"}});
        let path = Path::parse("items.0").unwrap();
        assert_eq!(path.lookup(&tree), Some(&json!("first")));
    }

    #[test]
    fn display_roundtrip() {
        let raw = "params.table.0.name";
        assert_eq!(Path::parse(raw).unwrap().to_string(), raw);
    }
}
