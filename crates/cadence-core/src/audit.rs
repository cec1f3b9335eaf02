// Audit records
//
// Exactly one audit record per release, emitted at terminal status. The
// persistence strategy is pluggable behind AuditSink; the default writes a
// JSON file per release.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::Result;
use crate::run_id::RunId;

/// The audit record of one release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Workflow name
    pub name: String,
    /// Record type discriminator, always `workflow`
    #[serde(rename = "type")]
    pub type_: String,
    /// Logical release time, minute granularity
    pub release: DateTime<Utc>,
    /// Final context tree
    pub context: Value,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    pub updated_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        name: impl Into<String>,
        release: DateTime<Utc>,
        context: Value,
        run_id: RunId,
        parent_run_id: Option<RunId>,
    ) -> Self {
        Self {
            name: name.into(),
            type_: "workflow".to_string(),
            release,
            context,
            run_id,
            parent_run_id,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence seam for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn save(&self, record: &AuditRecord) -> Result<()>;
}

/// Discards every record; used when auditing is disabled.
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn save(&self, _record: &AuditRecord) -> Result<()> {
        Ok(())
    }
}

/// Writes `<dir>/<workflow>/<run_id>.json`, one file per release.
pub struct FileAuditSink {
    dir: PathBuf,
}

impl FileAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Pick a sink from the configuration.
    pub fn from_config(config: &Config) -> Box<dyn AuditSink> {
        if !config.audit_enabled {
            return Box::new(NullAuditSink);
        }
        let dir = config
            .audit_url
            .strip_prefix("file://")
            .unwrap_or(config.audit_url.as_str());
        Box::new(FileAuditSink::new(dir))
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn save(&self, record: &AuditRecord) -> Result<()> {
        let dir = self.dir.join(&record.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| anyhow::anyhow!("audit dir: {e}"))?;
        let path = dir.join(format!("{}.json", record.run_id));
        let body =
            serde_json::to_vec_pretty(record).map_err(|e| anyhow::anyhow!("audit json: {e}"))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| anyhow::anyhow!("audit write {path:?}: {e}"))?;
        Ok(())
    }
}
