// Release identifiers
//
// A RunId is an opaque string: a microsecond timestamp prefix plus a short
// sha256 suffix over the workflow name and the prefix. The prefix keeps ids
// sortable by creation time; the suffix keeps two releases created in the
// same microsecond distinct per workflow.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque identifier naming one release of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id seeded with the workflow name.
    pub fn generate(seed: &str) -> Self {
        let ts = Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(ts.as_bytes());
        let digest = hasher.finalize();
        Self(format!("{}{}", ts, &hex::encode(digest)[..8]))
    }

    /// Wrap an existing id (e.g. read back from a prior context).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
