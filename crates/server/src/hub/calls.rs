use super::HubError;
use chrono::{DateTime, Duration, Utc};
use convo_proto::call::CallKind;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Offering,
    Answering,
    Active,
    Ended,
}

/// One call attempt between exactly two participants. Terminal
/// sessions are removed from the table; snapshots handed back by
/// teardown paths carry `Ended`.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub kind: CallKind,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl CallSession {
    /// The participant opposite to `user_id`, if `user_id` is one of
    /// the two.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.caller_id == user_id {
            Some(&self.callee_id)
        } else if self.callee_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

/// Table of in-flight call sessions, keyed by call id. Every
/// read-modify-write runs under the table's write lock, which
/// serializes racing offer/answer/ICE transitions for a call.
#[derive(Default)]
pub struct CallTable {
    inner: RwLock<HashMap<String, CallSession>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session in `Offering`. Rejected while any live call
    /// exists between the pair, in either direction; a busy pair gets
    /// a rejection, never a queued second session.
    pub async fn begin_offer(
        &self,
        call_id: &str,
        caller_id: &str,
        callee_id: &str,
        kind: CallKind,
    ) -> Result<(), HubError> {
        if caller_id == callee_id {
            return Err(HubError::InvalidCallState);
        }
        let mut sessions = self.inner.write().await;
        if sessions.contains_key(call_id) {
            return Err(HubError::InvalidCallState);
        }
        let pair_busy = sessions.values().any(|session| {
            session.peer_of(caller_id).is_some() && session.peer_of(callee_id).is_some()
        });
        if pair_busy {
            return Err(HubError::InvalidCallState);
        }
        let now = Utc::now();
        sessions.insert(
            call_id.to_string(),
            CallSession {
                call_id: call_id.to_string(),
                caller_id: caller_id.to_string(),
                callee_id: callee_id.to_string(),
                kind,
                state: CallState::Offering,
                created_at: now,
                last_update: now,
            },
        );
        Ok(())
    }

    /// Accepts an answer: only valid from `Offering`, only by the
    /// callee. Moves the session to `Answering` and returns the
    /// caller id the answer routes back to.
    pub async fn apply_answer(&self, call_id: &str, from: &str) -> Result<String, HubError> {
        let mut sessions = self.inner.write().await;
        let session = sessions.get_mut(call_id).ok_or(HubError::InvalidCallState)?;
        if session.callee_id != from || session.state != CallState::Offering {
            return Err(HubError::InvalidCallState);
        }
        session.state = CallState::Answering;
        session.last_update = Utc::now();
        Ok(session.caller_id.clone())
    }

    /// Commits `Active` once the forwarded answer has been routed.
    pub async fn mark_active(&self, call_id: &str) {
        let mut sessions = self.inner.write().await;
        if let Some(session) = sessions.get_mut(call_id) {
            if session.state == CallState::Answering {
                session.state = CallState::Active;
                session.last_update = Utc::now();
            }
        }
    }

    /// Resolves the relay destination for an ICE candidate. Unknown
    /// or already-torn-down calls yield `None` — late candidates are
    /// an expected race, not an error. A candidate from a
    /// non-participant is an error.
    pub async fn relay_target(
        &self,
        call_id: &str,
        from: &str,
    ) -> Result<Option<String>, HubError> {
        let mut sessions = self.inner.write().await;
        let Some(session) = sessions.get_mut(call_id) else {
            return Ok(None);
        };
        let Some(peer) = session.peer_of(from) else {
            return Err(HubError::InvalidCallState);
        };
        let peer = peer.to_string();
        session.last_update = Utc::now();
        Ok(Some(peer))
    }

    /// Tears a call down. Returns the final snapshot exactly once;
    /// ending an unknown or already-ended call is a no-op so the
    /// remaining peer never sees a duplicate end notification.
    pub async fn end(
        &self,
        call_id: &str,
        from: Option<&str>,
    ) -> Result<Option<CallSession>, HubError> {
        let mut sessions = self.inner.write().await;
        let Some(session) = sessions.get(call_id) else {
            debug!(call = %call_id, "end for unknown call session");
            return Ok(None);
        };
        if let Some(user_id) = from {
            if session.peer_of(user_id).is_none() {
                return Err(HubError::InvalidCallState);
            }
        }
        let Some(mut snapshot) = sessions.remove(call_id) else {
            return Ok(None);
        };
        snapshot.state = CallState::Ended;
        snapshot.last_update = Utc::now();
        Ok(Some(snapshot))
    }

    /// Force-ends every call involving a user whose last session
    /// disconnected.
    pub async fn end_for_user(&self, user_id: &str) -> Vec<CallSession> {
        let mut sessions = self.inner.write().await;
        let affected: Vec<String> = sessions
            .values()
            .filter(|session| session.peer_of(user_id).is_some())
            .map(|session| session.call_id.clone())
            .collect();
        affected
            .iter()
            .filter_map(|call_id| sessions.remove(call_id))
            .map(|mut snapshot| {
                snapshot.state = CallState::Ended;
                snapshot.last_update = Utc::now();
                snapshot
            })
            .collect()
    }

    /// Removes `Offering` sessions older than `max_age` so an
    /// unanswered offer cannot dangle past its deadline.
    pub async fn expire_offers(&self, max_age: Duration) -> Vec<CallSession> {
        let cutoff = Utc::now() - max_age;
        let mut sessions = self.inner.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|session| session.state == CallState::Offering && session.created_at < cutoff)
            .map(|session| session.call_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|call_id| sessions.remove(call_id))
            .map(|mut snapshot| {
                snapshot.state = CallState::Ended;
                snapshot.last_update = Utc::now();
                snapshot
            })
            .collect()
    }
}
