use super::HubError;
use crate::util::generate_id;
use chrono::{DateTime, Utc};
use convo_proto::Frame;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type SessionId = String;

/// One live connection for a user. The sender is the connection's
/// outbound frame queue; the sequence numbers outbound frames per
/// session.
pub struct SessionEntry {
    pub session_id: SessionId,
    pub user_id: String,
    pub connection_id: u64,
    pub sender: mpsc::Sender<Frame>,
    pub connected_at: DateTime<Utc>,
    sequence: AtomicU64,
}

impl SessionEntry {
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// Aggregate presence change caused by a registry transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
}

#[derive(Default)]
struct RegistryInner {
    by_session: HashMap<SessionId, Arc<SessionEntry>>,
    by_user: HashMap<String, Vec<Arc<SessionEntry>>>,
    connections: HashSet<u64>,
}

/// Owns every live session. All mutation happens under one write
/// lock, so `resolve` never observes a partially registered session.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for a user. Concurrent sessions from
    /// distinct connections are allowed; re-registering the same
    /// physical connection is refused.
    pub async fn register(
        &self,
        user_id: &str,
        connection_id: u64,
        sender: mpsc::Sender<Frame>,
    ) -> Result<(Arc<SessionEntry>, Option<PresenceTransition>), HubError> {
        let mut inner = self.inner.write().await;
        if !inner.connections.insert(connection_id) {
            return Err(HubError::AlreadyRegistered);
        }
        let was_online = inner
            .by_user
            .get(user_id)
            .map(|sessions| !sessions.is_empty())
            .unwrap_or(false);
        let entry = Arc::new(SessionEntry {
            session_id: generate_id(&format!("session:{user_id}")),
            user_id: user_id.to_string(),
            connection_id,
            sender,
            connected_at: Utc::now(),
            sequence: AtomicU64::new(0),
        });
        inner
            .by_session
            .insert(entry.session_id.clone(), Arc::clone(&entry));
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .push(Arc::clone(&entry));
        let transition = if was_online {
            None
        } else {
            Some(PresenceTransition::CameOnline)
        };
        Ok((entry, transition))
    }

    /// Removes a session. Idempotent: unregistering a missing session
    /// is a no-op.
    pub async fn unregister(
        &self,
        session_id: &str,
    ) -> Option<(Arc<SessionEntry>, Option<PresenceTransition>)> {
        let mut inner = self.inner.write().await;
        let entry = inner.by_session.remove(session_id)?;
        inner.connections.remove(&entry.connection_id);
        let still_online = match inner.by_user.get_mut(&entry.user_id) {
            Some(sessions) => {
                sessions.retain(|candidate| candidate.session_id != entry.session_id);
                if sessions.is_empty() {
                    inner.by_user.remove(&entry.user_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        };
        let transition = if still_online {
            None
        } else {
            Some(PresenceTransition::WentOffline)
        };
        Some((entry, transition))
    }

    /// All live sessions for a user; empty when offline.
    pub async fn resolve(&self, user_id: &str) -> Vec<Arc<SessionEntry>> {
        let inner = self.inner.read().await;
        inner.by_user.get(user_id).cloned().unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|sessions| !sessions.is_empty())
            .unwrap_or(false)
    }

    pub async fn online_users(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.by_user.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<Frame> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn online_reflects_live_session_count() {
        let registry = SessionRegistry::new();
        assert!(!registry.is_online("alice").await);
        let (first, transition) = registry.register("alice", 1, sender()).await.unwrap();
        assert_eq!(transition, Some(PresenceTransition::CameOnline));
        assert!(registry.is_online("alice").await);
        let (second, transition) = registry.register("alice", 2, sender()).await.unwrap();
        assert_eq!(transition, None);
        let (_, transition) = registry.unregister(&first.session_id).await.unwrap();
        assert_eq!(transition, None);
        assert!(registry.is_online("alice").await);
        let (_, transition) = registry.unregister(&second.session_id).await.unwrap();
        assert_eq!(transition, Some(PresenceTransition::WentOffline));
        assert!(!registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn duplicate_connection_is_refused() {
        let registry = SessionRegistry::new();
        registry.register("alice", 7, sender()).await.unwrap();
        let result = registry.register("alice", 7, sender()).await;
        assert!(matches!(result, Err(HubError::AlreadyRegistered)));
        // A different physical connection for the same user is fine.
        assert!(registry.register("alice", 8, sender()).await.is_ok());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (entry, _) = registry.register("bob", 1, sender()).await.unwrap();
        assert!(registry.unregister(&entry.session_id).await.is_some());
        assert!(registry.unregister(&entry.session_id).await.is_none());
        assert!(registry.unregister("never-existed").await.is_none());
    }

    #[tokio::test]
    async fn resolve_returns_all_live_sessions() {
        let registry = SessionRegistry::new();
        registry.register("carol", 1, sender()).await.unwrap();
        registry.register("carol", 2, sender()).await.unwrap();
        let sessions = registry.resolve("carol").await;
        assert_eq!(sessions.len(), 2);
        assert!(registry.resolve("nobody").await.is_empty());
        assert_eq!(registry.online_users().await, vec!["carol".to_string()]);
    }
}
