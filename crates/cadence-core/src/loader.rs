// Workflow document loading
//
// The engine consumes validated workflow graphs through the WorkflowStore
// seam; trigger stages resolve child workflows through the same seam. The
// file store scans the configured search paths for YAML documents; the
// memory store backs tests and embedded callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::workflow::{Workflow, WorkflowDoc};

/// Source of validated workflow specifications.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Resolve a workflow by name. Missing names are a loader error.
    async fn get(&self, name: &str) -> Result<Arc<Workflow>>;

    /// Names of every workflow this store can resolve, for the release
    /// scheduler's subscription pass.
    async fn names(&self) -> Result<Vec<String>>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryStore {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workflow: Workflow) {
        self.workflows.insert(workflow.name.clone(), Arc::new(workflow));
    }

    /// Parse and register every workflow document in a YAML string.
    /// Documents whose `type` names something else are skipped.
    pub fn insert_yaml(&mut self, yaml: &str, default_tz: &str) -> Result<()> {
        let docs: IndexMap<String, WorkflowDoc> = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::loader(format!("yaml does not parse: {e}")))?;
        for (name, doc) in docs {
            if matches!(&doc.type_, Some(ty) if ty != "Workflow") {
                continue;
            }
            self.insert(Workflow::from_doc(name, doc, default_tz)?);
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Arc<Workflow>> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::loader(format!("workflow {name:?} is not registered")))
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Store that scans `.yml`/`.yaml` files under the configured search paths.
/// Parsed specs are cached; the cache is rebuildable on explicit invalidation.
pub struct FileStore {
    paths: Vec<PathBuf>,
    default_tz: String,
    cache: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl FileStore {
    pub fn new(paths: Vec<PathBuf>, default_tz: impl Into<String>) -> Self {
        Self {
            paths,
            default_tz: default_tz.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.conf_paths.clone(), config.timezone.clone())
    }

    /// Drop the parsed-spec cache; the next lookup rescans the paths.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    async fn scan(&self) -> Result<HashMap<String, Arc<Workflow>>> {
        let mut found = HashMap::new();
        for base in &self.paths {
            let mut dir = match tokio::fs::read_dir(base).await {
                Ok(dir) => dir,
                // A missing search path is skipped, not fatal
                Err(_) => continue,
            };
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(|e| CoreError::loader(format!("scan {base:?}: {e}")))?
            {
                let path = entry.path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if !matches!(ext, "yml" | "yaml") {
                    continue;
                }
                let body = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| CoreError::loader(format!("read {path:?}: {e}")))?;
                let docs: IndexMap<String, WorkflowDoc> = serde_yaml::from_str(&body)
                    .map_err(|e| CoreError::loader(format!("{path:?} does not parse: {e}")))?;
                for (name, doc) in docs {
                    if doc.type_.as_deref() != Some("Workflow") {
                        continue;
                    }
                    let wf = Workflow::from_doc(name.clone(), doc, &self.default_tz)?;
                    // First match wins across search paths
                    found.entry(name).or_insert_with(|| Arc::new(wf));
                }
            }
        }
        Ok(found)
    }

    async fn ensure_scanned(&self) -> Result<()> {
        if self.cache.read().await.is_empty() {
            let found = self.scan().await?;
            *self.cache.write().await = found;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
    async fn get(&self, name: &str) -> Result<Arc<Workflow>> {
        self.ensure_scanned().await?;
        self.cache
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                CoreError::loader(format!("workflow {name:?} not found under {:?}", self.paths))
            })
    }

    async fn names(&self) -> Result<Vec<String>> {
        self.ensure_scanned().await?;
        let mut names: Vec<String> = self.cache.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
    first-wf:
      type: Workflow
      jobs:
        only:
          stages: [{name: hello, echo: hi}]
    not-a-workflow:
      type: Config
    "#;

    #[tokio::test]
    async fn memory_store_skips_other_document_types() {
        let mut store = MemoryStore::new();
        store.insert_yaml(DOC, "UTC").unwrap();
        assert!(store.get("first-wf").await.is_ok());
        assert!(store.get("not-a-workflow").await.is_err());
    }

    #[tokio::test]
    async fn file_store_scans_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("flows.yml"),
            "wf-a:\n  type: Workflow\n  jobs: {j: {stages: [{name: s, echo: x}]}}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileStore::new(vec![dir.path().to_path_buf()], "UTC");
        let wf = store.get("wf-a").await.unwrap();
        assert_eq!(wf.name, "wf-a");
        assert_eq!(store.names().await.unwrap(), vec!["wf-a".to_string()]);
        assert!(store.get("missing").await.is_err());

        // New file is invisible until invalidation
        std::fs::write(
            dir.path().join("more.yaml"),
            "wf-b:\n  type: Workflow\n  jobs: {}\n",
        )
        .unwrap();
        assert!(store.get("wf-b").await.is_err());
        store.invalidate().await;
        assert!(store.get("wf-b").await.is_ok());
    }
}
