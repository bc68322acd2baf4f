//! Credential/Session Store: persisted auth material for faster reacquisition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AgentResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSession {
    pub username: Option<String>,
    #[serde(default)]
    pub cookies: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub saved_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.token.is_none()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> AgentResult<Option<StoredSession>>;
    async fn save(&self, session: &StoredSession) -> AgentResult<()>;
    async fn clear(&self) -> AgentResult<()>;
}

/// JSON file store. Writes go through a temp file and a rename so a crash
/// never leaves a truncated file behind.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> AgentResult<Option<StoredSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<StoredSession>(&content) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable credential file");
                Ok(None)
            }
        }
    }

    async fn save(&self, session: &StoredSession) -> AgentResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(session)?)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), cookies = session.cookies.len(), "session artifacts saved");
        Ok(())
    }

    async fn clear(&self) -> AgentResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
