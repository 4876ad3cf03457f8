//! Session persistence as one JSON file per session.

use async_trait::async_trait;
use push_lifecycle::lock::sanitize_key;
use push_lifecycle::{LifecycleError, Result, SessionStore};
use push_session::SessionRecord;
use std::path::PathBuf;
use tracing::debug;

/// Stores `<dir>/<session>.json`
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File the session named `session_name` is stored in
    pub fn path_for(&self, session_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(session_name)))
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn load(&self, session_name: &str) -> Result<Option<SessionRecord>> {
        let path = self.path_for(session_name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LifecycleError::Session(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let record = serde_json::from_str(&content).map_err(|e| {
            LifecycleError::Session(format!("failed to parse {}: {}", path.display(), e))
        })?;
        debug!("Loaded session {} from {}", session_name, path.display());
        Ok(Some(record))
    }

    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.path_for(&record.session_name);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| LifecycleError::Session(format!("failed to encode session: {}", e)))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LifecycleError::Session(format!("failed to create {}: {}", self.dir.display(), e)))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| LifecycleError::Session(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| LifecycleError::Session(format!("failed to replace {}: {}", path.display(), e)))?;

        debug!("Saved session {} to {}", record.session_name, path.display());
        Ok(())
    }
}
