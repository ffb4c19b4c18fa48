//! Deferred update bookkeeping.
//!
//! When the user answers "Later", the verified artifact stays on disk and a
//! small JSON record remembers which version it holds. The next run that
//! sees the same version in the manifest re-verifies the retained file and
//! prompts again without downloading.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Record file name under the writable data directory.
pub const PENDING_FILE_NAME: &str = "pending-update.json";

/// A verified artifact the user chose not to install yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Version the artifact contains
    pub version: String,
    /// Retained artifact location
    pub artifact: PathBuf,
    /// Digest from the manifest the artifact was verified against
    #[serde(default)]
    pub sha256: Option<String>,
    /// When the user deferred the install
    pub deferred_at: DateTime<Utc>,
}

impl PendingUpdate {
    pub fn new(version: String, artifact: PathBuf, sha256: Option<String>) -> Self {
        Self {
            version,
            artifact,
            sha256,
            deferred_at: Utc::now(),
        }
    }

    /// Whether this record can stand in for a fresh download of `version`.
    pub fn matches(&self, version: &str, sha256: Option<&str>) -> bool {
        self.version == version
            && self.sha256.as_deref() == sha256
            && self.artifact.is_file()
    }
}

/// Loads and stores the pending record in the data directory.
#[derive(Debug, Clone)]
pub struct PendingStore {
    path: PathBuf,
}

impl PendingStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(PENDING_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, treating a missing or unreadable file as "none".
    pub async fn load(&self) -> Option<PendingUpdate> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read pending update record {:?}: {}", self.path, e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(pending) => Some(pending),
            Err(e) => {
                warn!("Discarding corrupt pending update record: {}", e);
                None
            }
        }
    }

    pub async fn save(&self, pending: &PendingUpdate) -> Result<(), UpdateError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(pending)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Recorded deferred update {}", pending.version);
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), UpdateError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_clear() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path());
        assert!(store.load().await.is_none());

        let artifact = dir.path().join("update.zip");
        std::fs::write(&artifact, b"PK\x03\x04").unwrap();
        let pending = PendingUpdate::new("1.2.0".to_string(), artifact.clone(), None);
        store.save(&pending).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, pending);
        assert!(loaded.matches("1.2.0", None));
        assert!(!loaded.matches("1.3.0", None));
        assert!(!loaded.matches("1.2.0", Some("ab")));

        store.clear().await.unwrap();
        assert!(store.load().await.is_none());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_artifact_does_not_match() {
        let dir = TempDir::new().unwrap();
        let pending = PendingUpdate::new("1.2.0".to_string(), dir.path().join("gone.zip"), None);
        assert!(!pending.matches("1.2.0", None));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = PendingStore::new(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().await.is_none());
    }
}
