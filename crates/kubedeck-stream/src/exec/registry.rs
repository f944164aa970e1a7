//! Registry of live exec sessions

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use kubedeck_common::{Error, Result};
use kubedeck_credentials::BundleId;

/// Lifecycle of one exec session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecState {
    /// Resolving the client and negotiating the remote stream
    Connecting,
    /// Both relay loops running
    Active,
    /// Ended; both loops and the remote stream released
    Closed,
}

/// Listing entry for one session
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSessionInfo {
    /// Session id
    pub id: Uuid,
    /// Bundle the client came from
    pub bundle_id: BundleId,
    /// Target name
    pub target: String,
    /// Requested namespace; `None` means the target's default
    pub namespace: Option<String>,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: Option<String>,
    /// Current state
    pub state: ExecState,
    /// When the session was opened
    pub started_at: DateTime<Utc>,
}

struct SessionEntry {
    info: ExecSessionInfo,
    cancel: CancellationToken,
}

/// Tracks active exec sessions so they can be listed and cancelled
#[derive(Default)]
pub struct ExecRegistry {
    active: DashMap<Uuid, SessionEntry>,
}

impl ExecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, info: ExecSessionInfo) -> CancellationToken {
        let cancel = CancellationToken::new();
        debug!(session = %info.id, pod = %info.pod, "Registering exec session");
        self.active.insert(
            info.id,
            SessionEntry {
                info,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub(crate) fn set_state(&self, id: Uuid, state: ExecState) {
        if let Some(mut entry) = self.active.get_mut(&id) {
            entry.info.state = state;
        }
    }

    /// Remove a session that has ended, returning its final record
    pub(crate) fn finish(&self, id: Uuid) -> Option<ExecSessionInfo> {
        self.active.remove(&id).map(|(_, entry)| ExecSessionInfo {
            state: ExecState::Closed,
            ..entry.info
        })
    }

    /// Snapshot of live sessions, oldest first
    pub fn list(&self) -> Vec<ExecSessionInfo> {
        let mut sessions: Vec<_> = self
            .active
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by_key(|info| info.started_at);
        sessions
    }

    /// Look up one session
    pub fn get(&self, id: Uuid) -> Option<ExecSessionInfo> {
        self.active.get(&id).map(|entry| entry.info.clone())
    }

    /// End one session
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        match self.active.remove(&id) {
            Some((_, entry)) => {
                info!(session = %id, "Cancelling exec session");
                entry.cancel.cancel();
                Ok(())
            }
            None => Err(Error::session_not_found(id.to_string())),
        }
    }

    /// End every session, e.g. on shutdown
    pub fn cancel_all(&self) {
        let count = self.active.len();
        if count > 0 {
            info!(count, "Cancelling all active exec sessions");
            self.active.retain(|_, entry| {
                entry.cancel.cancel();
                false
            });
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pod: &str) -> ExecSessionInfo {
        ExecSessionInfo {
            id: Uuid::new_v4(),
            bundle_id: BundleId::new(),
            target: "prod".into(),
            namespace: None,
            pod: pod.into(),
            container: None,
            state: ExecState::Connecting,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_set_state_and_list() {
        let registry = ExecRegistry::new();
        let first = info("web-0");
        let id = first.id;
        registry.register(first);
        registry.register(info("web-1"));

        registry.set_state(id, ExecState::Active);
        assert_eq!(registry.get(id).unwrap().state, ExecState::Active);
        assert_eq!(registry.list().len(), 2);

        let closed = registry.finish(id).unwrap();
        assert_eq!(closed.state, ExecState::Closed);
        assert_eq!(closed.pod, "web-0");
        assert!(registry.get(id).is_none());
        assert!(registry.finish(id).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_fires_token() {
        let registry = ExecRegistry::new();
        let session = info("web-0");
        let id = session.id;
        let token = registry.register(session);

        registry.cancel(id).unwrap();
        assert!(token.is_cancelled());
        assert!(registry.cancel(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_cancel_all() {
        let registry = ExecRegistry::new();
        let tokens: Vec<_> = (0..3)
            .map(|i| registry.register(info(&format!("web-{i}"))))
            .collect();

        registry.cancel_all();
        assert!(registry.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
