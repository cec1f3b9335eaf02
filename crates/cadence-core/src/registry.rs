// Caller registry
//
// Call stages reference a callable by `<group>/<name>@<tag>`. The registry is
// an explicit value populated at init and read-only afterwards; how it gets
// populated is outside the core.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// A reference of the form `group/name@tag`. Resolution is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsesRef {
    pub group: String,
    pub name: String,
    pub tag: String,
}

impl UsesRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let (group, rest) = raw
            .split_once('/')
            .ok_or_else(|| CoreError::caller(format!("uses {raw:?} is missing the group")))?;
        let (name, tag) = rest
            .split_once('@')
            .ok_or_else(|| CoreError::caller(format!("uses {raw:?} is missing the @tag")))?;
        if group.is_empty() || name.is_empty() || tag.is_empty() {
            return Err(CoreError::caller(format!("uses {raw:?} has an empty component")));
        }
        Ok(Self {
            group: group.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl std::fmt::Display for UsesRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.group, self.name, self.tag)
    }
}

/// An executable registered under a uses-reference. The returned mapping
/// becomes the stage outputs.
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> Result<Map<String, Value>>;
}

/// Blanket impl so plain async closures can register without a newtype.
#[async_trait]
impl<F, Fut> Caller for F
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Map<String, Value>>> + Send,
{
    async fn call(&self, args: Map<String, Value>) -> Result<Map<String, Value>> {
        self(args).await
    }
}

/// Lookup from uses-reference to callable. Built at load time.
#[derive(Clone, Default)]
pub struct CallerRegistry {
    callers: HashMap<UsesRef, Arc<dyn Caller>>,
}

impl std::fmt::Debug for CallerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.callers.keys().map(|r| r.to_string()).collect();
        names.sort();
        f.debug_struct("CallerRegistry").field("callers", &names).finish()
    }
}

impl CallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under `group/name@tag`.
    pub fn register(&mut self, reference: &str, caller: Arc<dyn Caller>) -> Result<()> {
        let parsed = UsesRef::parse(reference)?;
        self.callers.insert(parsed, caller);
        Ok(())
    }

    /// Exact lookup; a missing entry is a Stage error at the call site.
    pub fn get(&self, reference: &str) -> Result<Arc<dyn Caller>> {
        let parsed = UsesRef::parse(reference)?;
        self.callers
            .get(&parsed)
            .cloned()
            .ok_or_else(|| CoreError::caller(format!("no caller registered for {parsed}")))
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}
