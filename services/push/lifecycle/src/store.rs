//! Session persistence seam.

use async_trait::async_trait;
use dashmap::DashMap;
use push_session::SessionRecord;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;

/// Storage for session records, keyed by session name
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the record stored under `session_name`
    async fn load(&self, session_name: &str) -> Result<Option<SessionRecord>>;

    /// Store `record`, replacing any previous one with the same name
    async fn save(&self, record: &SessionRecord) -> Result<()>;
}

/// In-memory session store
#[derive(Debug, Default, Clone)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_name: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(session_name).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &SessionRecord) -> Result<()> {
        debug!("Saving session {}", record.session_name);
        self.sessions
            .insert(record.session_name.clone(), record.clone());
        Ok(())
    }
}
