//! Gateway session tracking.

use beacon_common::{SessionId, SessionIdGenerator};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tracks all open signaling connections and hands out their ids.
pub struct SessionTracker {
    ids: SessionIdGenerator,
    /// Map of session_id → Session
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub remote: Option<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            ids: SessionIdGenerator::default(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Assign the next session id to a new connection.
    pub async fn open(&self, remote: Option<String>) -> SessionId {
        let session_id = self.ids.next_id();
        let session = Session {
            session_id,
            remote,
            connected_at: chrono::Utc::now(),
        };
        self.sessions.write().await.insert(session_id, session);
        session_id
    }

    /// Mark a session closed. Returns the record if it was open.
    pub async fn close(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.write().await.remove(&session_id)
    }

    pub async fn get(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Get total active sessions count.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}
