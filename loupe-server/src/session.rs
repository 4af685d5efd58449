// Client session management
//
// One session per connection. Sessions share the debugger; each keeps its own
// return-value load configuration.

use loupe_core::types::LoadConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type SessionId = String;

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: SessionId,
    pub peer: String,
    /// Applied to `StepOut` and `Call` return values; none means they are not loaded.
    pub return_values_load_config: Option<LoadConfig>,
}

#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<SessionId, Arc<Mutex<Session>>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(&self, peer: &str) -> SessionId {
        let session_id = format!("session_{}", uuid::v4());
        let session = Session {
            id: session_id.clone(),
            peer: peer.to_string(),
            return_values_load_config: None,
        };

        let mut sessions = self.sessions.lock().await;
        sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));
        session_id
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).cloned()
    }

    pub async fn return_values_load_config(&self, session_id: &str) -> Option<LoadConfig> {
        let session = self.get_session(session_id).await?;
        let session = session.lock().await;
        session.return_values_load_config.clone()
    }

    pub async fn set_return_values_load_config(&self, session_id: &str, cfg: Option<LoadConfig>) {
        if let Some(session) = self.get_session(session_id).await {
            session.lock().await.return_values_load_config = cfg;
        }
    }

    /// Drop a session; returns how many remain.
    pub async fn remove_session(&self, session_id: &str) -> usize {
        let mut sessions = self.sessions.lock().await;
        let removed = sessions.remove(session_id);
        let remaining = sessions.len();
        drop(sessions);
        if let Some(session) = removed {
            let session = session.lock().await;
            debug!("Closed {} from {}", session.id, session.peer);
        }
        remaining
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

// Session ids only need to be unique within one server run
mod uuid {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(1);

    pub fn v4() -> String {
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        format!("{:x}{:x}", timestamp, counter)
    }
}
