pub mod calls;
pub mod presence;
pub mod receipts;
pub mod registry;

use crate::config::HubConfig;
use crate::metrics::Metrics;
use crate::util::generate_id;
use calls::CallTable;
use chrono::{Duration, TimeZone, Utc};
use convo_proto::call::{CallAnswer, CallEnd, CallEndReason, CallOffer, IceCandidate};
use convo_proto::chat::{ChatMessage, PresenceStatus, PresenceUpdate, ReadReceipt, ReceiptUpdate, TypingUpdate};
use convo_proto::{ControlEnvelope, Frame, FrameType};
use convo_store::{ChatStore, Directory, NewMessage, StoreError};
use presence::PresenceTracker;
use receipts::ReadTracker;
use registry::{PresenceTransition, SessionEntry, SessionId, SessionRegistry};
use serde_json::json;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum HubError {
    AlreadyRegistered,
    NotAMember,
    CalleeOffline,
    InvalidCallState,
    Malformed,
    Codec,
    Store,
}

impl HubError {
    /// Stable diagnostic code carried in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRegistered => "already-registered",
            Self::NotAMember => "not-a-member",
            Self::CalleeOffline => "callee-offline",
            Self::InvalidCallState => "invalid-call-state",
            Self::Malformed => "malformed-frame",
            Self::Codec => "codec-failure",
            Self::Store => "store-failure",
        }
    }
}

impl Display for HubError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "connection already registered"),
            Self::NotAMember => write!(f, "sender is not a member of the chat"),
            Self::CalleeOffline => write!(f, "callee has no live session"),
            Self::InvalidCallState => write!(f, "frame not valid for the call state"),
            Self::Malformed => write!(f, "malformed frame"),
            Self::Codec => write!(f, "frame codec failure"),
            Self::Store => write!(f, "store failure"),
        }
    }
}

impl Error for HubError {}

impl From<StoreError> for HubError {
    fn from(_: StoreError) -> Self {
        HubError::Store
    }
}

impl From<convo_proto::CodecError> for HubError {
    fn from(_: convo_proto::CodecError) -> Self {
        HubError::Codec
    }
}

/// Result of routing one chat frame. Offline members are covered by
/// persistence alone; the hub keeps no delivery queue of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(Vec<SessionId>),
    QueuedOffline,
    Rejected(&'static str),
}

/// Long-lived shared state: the registry and call table are the only
/// hub-owned mutable structures; membership and history stay with the
/// external collaborators.
pub struct HubState {
    pub config: HubConfig,
    pub registry: SessionRegistry,
    pub presence: PresenceTracker,
    pub calls: CallTable,
    pub receipts: ReadTracker,
    pub store: Arc<dyn ChatStore>,
    pub directory: Arc<dyn Directory>,
    pub metrics: Metrics,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        store: Arc<dyn ChatStore>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        Arc::new(HubState {
            config,
            registry: SessionRegistry::new(),
            presence: PresenceTracker::new(),
            calls: CallTable::new(),
            receipts: ReadTracker::new(),
            store,
            directory,
            metrics: Metrics::new(),
        })
    }
}

pub struct Hub {
    state: Arc<HubState>,
}

impl Hub {
    pub fn new(state: Arc<HubState>) -> Self {
        Hub { state }
    }

    pub fn state(&self) -> &Arc<HubState> {
        &self.state
    }

    /// Registers a fresh connection and broadcasts the presence delta
    /// if the user just came online.
    pub async fn connect(
        &self,
        user_id: &str,
        connection_id: u64,
        sender: mpsc::Sender<Frame>,
    ) -> Result<Arc<SessionEntry>, HubError> {
        let (entry, transition) = self
            .state
            .registry
            .register(user_id, connection_id, sender)
            .await?;
        self.state.metrics.incr_connections();
        info!(user = %user_id, session = %entry.session_id, "session registered");
        if let Some(transition) = transition {
            self.broadcast_presence(user_id, transition).await;
        }
        Ok(entry)
    }

    /// Removes a session. If this was the user's last connection,
    /// clears typing state, force-ends their calls and broadcasts the
    /// offline delta. In-flight sends to other destinations are not
    /// affected.
    pub async fn disconnect(&self, session_id: &str) {
        let Some((entry, transition)) = self.state.registry.unregister(session_id).await else {
            return;
        };
        self.state.metrics.decr_connections();
        info!(user = %entry.user_id, session = %session_id, "session closed");
        if transition == Some(PresenceTransition::WentOffline) {
            self.state.presence.clear_user(&entry.user_id).await;
            for snapshot in self.state.calls.end_for_user(&entry.user_id).await {
                self.state.metrics.mark_call_ended();
                info!(call = %snapshot.call_id, user = %entry.user_id, "call ended by disconnect");
                if let Some(peer) = snapshot.peer_of(&entry.user_id) {
                    let peer = peer.to_string();
                    self.notify_call_end(
                        &snapshot.call_id,
                        &peer,
                        CallEndReason::PeerDisconnected,
                    )
                    .await;
                }
            }
            self.broadcast_presence(&entry.user_id, PresenceTransition::WentOffline)
                .await;
        }
    }

    /// Single inbound entry point: every frame read from a connection
    /// lands here, already decoded. Frames are processed sequentially
    /// per connection, which is what gives per-sender FIFO.
    pub async fn handle_frame(&self, origin: &Arc<SessionEntry>, frame: Frame) {
        self.state.metrics.mark_ingress();
        match frame.frame_type {
            FrameType::Text | FrameType::Media => {
                match ChatMessage::try_from(&frame.payload) {
                    Ok(message) => {
                        if frame.frame_type == FrameType::Media && message.media_url.is_none() {
                            self.reject(origin, HubError::Malformed, json!({"field": "media_url"}))
                                .await;
                            return;
                        }
                        if let DeliveryOutcome::Rejected(code) =
                            self.route_message(origin, frame.frame_type, message).await
                        {
                            self.state.metrics.mark_rejected();
                            self.send_error(origin, json!({"error": code})).await;
                        }
                    }
                    Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
                }
            }
            FrameType::Typing => match TypingUpdate::try_from(&frame.payload) {
                Ok(typing) => self.route_typing(origin, typing).await,
                Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
            },
            FrameType::Read => match ReadReceipt::try_from(&frame.payload) {
                Ok(receipt) => self.route_read(origin, receipt).await,
                Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
            },
            FrameType::CallOffer => match CallOffer::try_from(&frame.payload) {
                Ok(offer) => self.route_call_offer(origin, offer).await,
                Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
            },
            FrameType::CallAnswer => match CallAnswer::try_from(&frame.payload) {
                Ok(answer) => self.route_call_answer(origin, answer).await,
                Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
            },
            FrameType::IceCandidate => match IceCandidate::try_from(&frame.payload) {
                Ok(candidate) => self.route_ice_candidate(origin, candidate).await,
                Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
            },
            FrameType::CallEnd => match CallEnd::try_from(&frame.payload) {
                Ok(end) => self.route_call_end(origin, end).await,
                Err(_) => self.reject(origin, HubError::Malformed, json!({})).await,
            },
            FrameType::Hello => {
                // Identity is fixed at handshake time.
                self.reject(origin, HubError::Malformed, json!({"detail": "duplicate hello"}))
                    .await;
            }
            FrameType::Status | FrameType::Receipt | FrameType::Error => {
                debug!(
                    user = %origin.user_id,
                    frame = ?frame.frame_type,
                    "dropping hub-emitted frame type from client"
                );
            }
        }
    }

    /// Routes one text/media frame: membership and liveness are both
    /// re-resolved here, never cached from frame creation time.
    pub async fn route_message(
        &self,
        origin: &Arc<SessionEntry>,
        frame_type: FrameType,
        mut message: ChatMessage,
    ) -> DeliveryOutcome {
        let conversation = match self.state.store.members(&message.chat_id).await {
            Ok(conversation) => conversation,
            Err(StoreError::UnknownChat) => {
                return DeliveryOutcome::Rejected(HubError::NotAMember.code())
            }
            Err(err) => {
                warn!(chat = %message.chat_id, error = %err, "membership lookup failed");
                return DeliveryOutcome::Rejected(HubError::Store.code());
            }
        };
        if !conversation.members.contains(&origin.user_id) {
            return DeliveryOutcome::Rejected(HubError::NotAMember.code());
        }
        message.sender_id = origin.user_id.clone();
        let sent_at = message
            .sent_at
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
        let stored = match self
            .state
            .store
            .append(NewMessage {
                chat_id: message.chat_id.clone(),
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
                media_url: message.media_url.clone(),
                sent_at,
            })
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                warn!(chat = %message.chat_id, error = %err, "message persist failed");
                return DeliveryOutcome::Rejected(HubError::Store.code());
            }
        };
        message.message_id = Some(stored.message_id);
        message.sent_at = Some(stored.created_at.timestamp_millis());
        let envelope = match ControlEnvelope::try_from(&message) {
            Ok(envelope) => envelope,
            Err(_) => return DeliveryOutcome::Rejected(HubError::Codec.code()),
        };
        let mut delivered = Vec::new();
        for member in conversation.members.iter() {
            for session in self.state.registry.resolve(member).await {
                // The sender's other devices receive the message for
                // multi-device sync; the originating session does not.
                if session.session_id == origin.session_id {
                    continue;
                }
                if self.send_control(&session, frame_type, envelope.clone()).await {
                    delivered.push(session.session_id.clone());
                }
            }
        }
        if delivered.is_empty() {
            DeliveryOutcome::QueuedOffline
        } else {
            DeliveryOutcome::Delivered(delivered)
        }
    }

    async fn route_typing(&self, origin: &Arc<SessionEntry>, mut typing: TypingUpdate) {
        let Some(conversation) = self.member_checked(origin, &typing.chat_id).await else {
            return;
        };
        typing.user_id = origin.user_id.clone();
        if !self
            .state
            .presence
            .should_forward_typing(&typing.chat_id, &typing.user_id, typing.is_typing)
            .await
        {
            return;
        }
        let Ok(envelope) = ControlEnvelope::try_from(&typing) else {
            return;
        };
        for member in conversation.members.iter() {
            if member == &origin.user_id {
                continue;
            }
            for session in self.state.registry.resolve(member).await {
                self.send_control(&session, FrameType::Typing, envelope.clone())
                    .await;
            }
        }
    }

    async fn route_read(&self, origin: &Arc<SessionEntry>, mut receipt: ReadReceipt) {
        if self.member_checked(origin, &receipt.chat_id).await.is_none() {
            return;
        }
        receipt.reader_id = origin.user_id.clone();
        let advanced = self
            .state
            .receipts
            .advance(&receipt.chat_id, &receipt.reader_id, receipt.up_to)
            .await;
        if !advanced {
            debug!(chat = %receipt.chat_id, reader = %receipt.reader_id, "stale read cursor ignored");
            return;
        }
        if let Err(err) = self
            .state
            .store
            .mark_read(&receipt.chat_id, &receipt.reader_id, receipt.up_to)
            .await
        {
            warn!(chat = %receipt.chat_id, error = %err, "mark read failed");
        }
        let messages = match self.state.store.list(&receipt.chat_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(chat = %receipt.chat_id, error = %err, "history lookup failed");
                return;
            }
        };
        let senders: HashSet<&str> = messages
            .iter()
            .filter(|message| {
                message.message_id <= receipt.up_to && message.sender_id != origin.user_id
            })
            .map(|message| message.sender_id.as_str())
            .collect();
        let update = ReceiptUpdate {
            chat_id: receipt.chat_id.clone(),
            reader_id: receipt.reader_id.clone(),
            up_to: receipt.up_to,
        };
        let Ok(envelope) = ControlEnvelope::try_from(&update) else {
            return;
        };
        for sender in senders {
            for session in self.state.registry.resolve(sender).await {
                self.send_control(&session, FrameType::Receipt, envelope.clone())
                    .await;
            }
        }
    }

    async fn route_call_offer(&self, origin: &Arc<SessionEntry>, mut offer: CallOffer) {
        if offer.recipient_id.is_empty() {
            self.reject(origin, HubError::Malformed, json!({"field": "recipient_id"}))
                .await;
            return;
        }
        if offer.call_id.is_empty() {
            offer.call_id = generate_id(&format!("call:{}:{}", origin.user_id, offer.recipient_id));
        }
        offer.caller_id = origin.user_id.clone();
        let targets = self.state.registry.resolve(&offer.recipient_id).await;
        if targets.is_empty() {
            // No dangling Offering session is left behind.
            self.reject(
                origin,
                HubError::CalleeOffline,
                json!({"call_id": offer.call_id, "recipient_id": offer.recipient_id}),
            )
            .await;
            return;
        }
        match self
            .state
            .calls
            .begin_offer(&offer.call_id, &origin.user_id, &offer.recipient_id, offer.kind)
            .await
        {
            Ok(()) => {
                self.state.metrics.mark_call_started();
                info!(
                    call = %offer.call_id,
                    caller = %offer.caller_id,
                    callee = %offer.recipient_id,
                    kind = ?offer.kind,
                    "call offer routed"
                );
                let Ok(envelope) = ControlEnvelope::try_from(&offer) else {
                    return;
                };
                // The offer reaches every live session of the callee.
                for session in targets.iter() {
                    self.send_control(session, FrameType::CallOffer, envelope.clone())
                        .await;
                }
            }
            Err(err) => {
                self.reject(origin, err, json!({"call_id": offer.call_id})).await;
            }
        }
    }

    async fn route_call_answer(&self, origin: &Arc<SessionEntry>, mut answer: CallAnswer) {
        answer.callee_id = origin.user_id.clone();
        match self
            .state
            .calls
            .apply_answer(&answer.call_id, &origin.user_id)
            .await
        {
            Ok(caller_id) => {
                info!(call = %answer.call_id, callee = %origin.user_id, "call answered");
                if let Ok(envelope) = ControlEnvelope::try_from(&answer) {
                    // The answer routes only back to the caller; the
                    // callee's other sessions already saw the offer.
                    for session in self.state.registry.resolve(&caller_id).await {
                        self.send_control(&session, FrameType::CallAnswer, envelope.clone())
                            .await;
                    }
                }
                self.state.calls.mark_active(&answer.call_id).await;
            }
            Err(err) => {
                self.reject(origin, err, json!({"call_id": answer.call_id})).await;
            }
        }
    }

    async fn route_ice_candidate(&self, origin: &Arc<SessionEntry>, mut candidate: IceCandidate) {
        candidate.sender_id = origin.user_id.clone();
        match self
            .state
            .calls
            .relay_target(&candidate.call_id, &origin.user_id)
            .await
        {
            Ok(Some(peer)) => {
                if let Ok(envelope) = ControlEnvelope::try_from(&candidate) {
                    for session in self.state.registry.resolve(&peer).await {
                        self.send_control(&session, FrameType::IceCandidate, envelope.clone())
                            .await;
                    }
                }
            }
            Ok(None) => {
                debug!(call = %candidate.call_id, "late ice candidate dropped");
            }
            Err(err) => {
                self.reject(origin, err, json!({"call_id": candidate.call_id})).await;
            }
        }
    }

    async fn route_call_end(&self, origin: &Arc<SessionEntry>, end: CallEnd) {
        match self.state.calls.end(&end.call_id, Some(&origin.user_id)).await {
            Ok(Some(snapshot)) => {
                self.state.metrics.mark_call_ended();
                info!(
                    call = %end.call_id,
                    user = %origin.user_id,
                    reason = end.reason.as_str(),
                    "call ended"
                );
                if let Some(peer) = snapshot.peer_of(&origin.user_id) {
                    let peer = peer.to_string();
                    self.notify_call_end(&end.call_id, &peer, end.reason).await;
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.reject(origin, err, json!({"call_id": end.call_id})).await;
            }
        }
    }

    pub(crate) async fn notify_call_end(&self, call_id: &str, user_id: &str, reason: CallEndReason) {
        let end = CallEnd {
            call_id: call_id.to_string(),
            reason,
        };
        let Ok(envelope) = ControlEnvelope::try_from(&end) else {
            return;
        };
        for session in self.state.registry.resolve(user_id).await {
            self.send_control(&session, FrameType::CallEnd, envelope.clone())
                .await;
        }
    }

    /// Resolves the chat and confirms the origin is a member; rejects
    /// the frame otherwise. Unknown chats are indistinguishable from
    /// non-membership on purpose.
    async fn member_checked(
        &self,
        origin: &Arc<SessionEntry>,
        chat_id: &str,
    ) -> Option<convo_store::Conversation> {
        match self.state.store.members(chat_id).await {
            Ok(conversation) if conversation.members.contains(&origin.user_id) => {
                Some(conversation)
            }
            Ok(_) => {
                self.reject(origin, HubError::NotAMember, json!({"chat_id": chat_id}))
                    .await;
                None
            }
            Err(StoreError::UnknownChat) => {
                self.reject(origin, HubError::NotAMember, json!({"chat_id": chat_id}))
                    .await;
                None
            }
            Err(err) => {
                warn!(chat = %chat_id, error = %err, "membership lookup failed");
                self.reject(origin, HubError::Store, json!({"chat_id": chat_id}))
                    .await;
                None
            }
        }
    }

    async fn broadcast_presence(&self, user_id: &str, transition: PresenceTransition) {
        let status = match transition {
            PresenceTransition::CameOnline => PresenceStatus::Online,
            PresenceTransition::WentOffline => PresenceStatus::Offline,
        };
        let update = PresenceUpdate {
            user_id: user_id.to_string(),
            status,
        };
        let Ok(envelope) = ControlEnvelope::try_from(&update) else {
            return;
        };
        // Interest is resolved at broadcast time: every other online
        // user sharing at least one conversation.
        for other in self.state.registry.online_users().await {
            if other == user_id {
                continue;
            }
            match self.state.directory.shared_chats(user_id, &other).await {
                Ok(shared) if !shared.is_empty() => {
                    for session in self.state.registry.resolve(&other).await {
                        self.send_control(&session, FrameType::Status, envelope.clone())
                            .await;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(user = %other, error = %err, "shared chat lookup failed");
                }
            }
        }
    }

    async fn reject(&self, origin: &Arc<SessionEntry>, err: HubError, context: serde_json::Value) {
        self.state.metrics.mark_rejected();
        debug!(user = %origin.user_id, error = %err, "frame rejected");
        let mut properties = json!({"error": err.code()});
        if let (Some(map), Some(extra)) = (properties.as_object_mut(), context.as_object()) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        self.send_error(origin, properties).await;
    }

    async fn send_error(&self, origin: &Arc<SessionEntry>, properties: serde_json::Value) {
        self.send_control(origin, FrameType::Error, ControlEnvelope { properties })
            .await;
    }

    /// One bounded send to one destination. A slow or stalled
    /// recipient only loses its own copy; fan-out to the remaining
    /// destinations proceeds.
    async fn send_control(
        &self,
        session: &SessionEntry,
        frame_type: FrameType,
        payload: ControlEnvelope,
    ) -> bool {
        let frame = Frame {
            sequence: session.next_sequence(),
            frame_type,
            payload,
        };
        let deadline = StdDuration::from_millis(self.state.config.send_timeout_ms);
        match timeout(deadline, session.sender.send(frame)).await {
            Ok(Ok(())) => {
                self.state.metrics.mark_egress();
                true
            }
            Ok(Err(_)) => {
                self.state.metrics.mark_send_failed();
                warn!(session = %session.session_id, "send to closed session dropped");
                false
            }
            Err(_) => {
                self.state.metrics.mark_send_failed();
                warn!(session = %session.session_id, "send timed out under backpressure");
                false
            }
        }
    }
}

/// Ends `Offering` calls that outlived the configured answer
/// deadline, notifying both parties with reason `timeout`.
pub async fn call_timeout_worker(state: Arc<HubState>) {
    let hub = Hub::new(Arc::clone(&state));
    let max_age = Duration::seconds(state.config.offer_timeout_secs as i64);
    let mut ticker = interval(StdDuration::from_secs(5));
    loop {
        ticker.tick().await;
        for snapshot in state.calls.expire_offers(max_age).await {
            state.metrics.mark_call_ended();
            info!(call = %snapshot.call_id, "unanswered offer timed out");
            hub.notify_call_end(&snapshot.call_id, &snapshot.caller_id, CallEndReason::Timeout)
                .await;
            hub.notify_call_end(&snapshot.call_id, &snapshot.callee_id, CallEndReason::Timeout)
                .await;
        }
    }
}

/// Periodically logs the Prometheus-format counter snapshot.
pub async fn metrics_worker(state: Arc<HubState>) {
    let mut ticker = interval(StdDuration::from_secs(state.config.metrics_interval_secs.max(1)));
    loop {
        ticker.tick().await;
        debug!(snapshot = %state.metrics.encode_prometheus(), "metrics snapshot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_proto::call::CallKind;
    use convo_store::MemoryStore;
    use tokio::sync::mpsc::Receiver;

    async fn hub_with_store() -> (Hub, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = HubState::new(
            HubConfig::default(),
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Arc::clone(&store) as Arc<dyn Directory>,
        );
        (Hub::new(state), store)
    }

    async fn connect(hub: &Hub, user: &str, connection_id: u64) -> (Arc<SessionEntry>, Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let entry = hub.connect(user, connection_id, tx).await.unwrap();
        (entry, rx)
    }

    fn frame_of<T>(frame_type: FrameType, payload: &T) -> Frame
    where
        for<'a> ControlEnvelope: TryFrom<&'a T, Error = convo_proto::CodecError>,
    {
        Frame {
            sequence: 0,
            frame_type,
            payload: ControlEnvelope::try_from(payload).unwrap(),
        }
    }

    fn text_message(chat_id: &str, content: &str) -> ChatMessage {
        ChatMessage {
            chat_id: chat_id.to_string(),
            sender_id: String::new(),
            content: content.to_string(),
            media_url: None,
            message_id: None,
            sent_at: None,
        }
    }

    #[tokio::test]
    async fn message_reaches_every_member_session_except_origin() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c42", &["alice", "bob"], false).await;
        let (alice_1, _alice_1_rx) = connect(&hub, "alice", 1).await;
        let (_alice_2, mut alice_2_rx) = connect(&hub, "alice", 2).await;
        let (_bob, mut bob_rx) = connect(&hub, "bob", 3).await;

        let outcome = hub
            .route_message(&alice_1, FrameType::Text, text_message("c42", "hi"))
            .await;
        let DeliveryOutcome::Delivered(sessions) = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(sessions.len(), 2);

        let to_bob = bob_rx.recv().await.unwrap();
        assert_eq!(to_bob.frame_type, FrameType::Text);
        let message = ChatMessage::try_from(&to_bob.payload).unwrap();
        assert_eq!(message.sender_id, "alice");
        assert!(message.message_id.is_some());

        // The sender's other device syncs; the origin session stays
        // quiet.
        let to_other_device = alice_2_rx.recv().await.unwrap();
        assert_eq!(to_other_device.frame_type, FrameType::Text);
    }

    #[tokio::test]
    async fn offline_member_is_covered_by_persistence_only() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c42", &["alice", "bob"], false).await;
        let (alice_1, _rx1) = connect(&hub, "alice", 1).await;
        let (_alice_2, mut alice_2_rx) = connect(&hub, "alice", 2).await;

        let outcome = hub
            .route_message(&alice_1, FrameType::Text, text_message("c42", "hi"))
            .await;
        let DeliveryOutcome::Delivered(sessions) = outcome else {
            panic!("expected delivery to the sender's other device");
        };
        assert_eq!(sessions.len(), 1);
        assert!(alice_2_rx.recv().await.is_some());

        // Persisted regardless of who was online.
        let history = store.list("c42").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn lone_sender_gets_queued_offline() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, _rx) = connect(&hub, "alice", 1).await;
        let outcome = hub
            .route_message(&alice, FrameType::Text, text_message("c1", "anyone?"))
            .await;
        assert_eq!(outcome, DeliveryOutcome::QueuedOffline);
        assert_eq!(store.list("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_member_is_rejected_not_persisted() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c42", &["alice", "bob"], false).await;
        store.add_user("carol").await;
        let (carol, mut carol_rx) = connect(&hub, "carol", 1).await;
        let outcome = hub
            .route_message(&carol, FrameType::Text, text_message("c42", "hi"))
            .await;
        assert_eq!(outcome, DeliveryOutcome::Rejected("not-a-member"));
        assert!(store.list("c42").await.unwrap().is_empty());

        // The same rejection via the frame path notifies the sender.
        hub.handle_frame(&carol, frame_of(FrameType::Text, &text_message("c42", "hi")))
            .await;
        let error = carol_rx.recv().await.unwrap();
        assert_eq!(error.frame_type, FrameType::Error);
        assert_eq!(
            error.payload.properties.get("error").and_then(|v| v.as_str()),
            Some("not-a-member")
        );
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, _rx) = connect(&hub, "alice", 1).await;
        let (_bob, mut bob_rx) = connect(&hub, "bob", 2).await;
        hub.route_message(&alice, FrameType::Text, text_message("c1", "first"))
            .await;
        hub.route_message(&alice, FrameType::Text, text_message("c1", "second"))
            .await;
        let first = ChatMessage::try_from(&bob_rx.recv().await.unwrap().payload).unwrap();
        let second = ChatMessage::try_from(&bob_rx.recv().await.unwrap().payload).unwrap();
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");
        assert!(first.message_id.unwrap() < second.message_id.unwrap());
    }

    #[tokio::test]
    async fn media_without_url_is_malformed() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, mut alice_rx) = connect(&hub, "alice", 1).await;
        hub.handle_frame(&alice, frame_of(FrameType::Media, &text_message("c1", "pic")))
            .await;
        let error = alice_rx.recv().await.unwrap();
        assert_eq!(error.frame_type, FrameType::Error);
        assert_eq!(
            error.payload.properties.get("error").and_then(|v| v.as_str()),
            Some("malformed-frame")
        );
        assert!(store.list("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn presence_delta_reaches_conversation_partners() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        store.add_conversation("c2", &["carol", "dave"], false).await;
        let (_bob, mut bob_rx) = connect(&hub, "bob", 1).await;
        let (_carol, mut carol_rx) = connect(&hub, "carol", 2).await;

        let (alice, _alice_rx) = connect(&hub, "alice", 3).await;
        let status = bob_rx.recv().await.unwrap();
        assert_eq!(status.frame_type, FrameType::Status);
        let update = PresenceUpdate::try_from(&status.payload).unwrap();
        assert_eq!(update.user_id, "alice");
        assert_eq!(update.status, PresenceStatus::Online);
        // Carol shares no conversation with alice.
        assert!(carol_rx.try_recv().is_err());

        hub.disconnect(&alice.session_id).await;
        let status = bob_rx.recv().await.unwrap();
        let update = PresenceUpdate::try_from(&status.payload).unwrap();
        assert_eq!(update.status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn second_session_produces_no_presence_delta() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (_bob, mut bob_rx) = connect(&hub, "bob", 1).await;
        let (alice_1, _rx1) = connect(&hub, "alice", 2).await;
        bob_rx.recv().await.unwrap();
        let (_alice_2, _rx2) = connect(&hub, "alice", 3).await;
        hub.disconnect(&alice_1.session_id).await;
        // Still online through the second session: no delta either way.
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_stop_duplicate_is_not_forwarded() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, _rx) = connect(&hub, "alice", 1).await;
        let (_bob, mut bob_rx) = connect(&hub, "bob", 2).await;
        let typing = |is_typing| TypingUpdate {
            chat_id: "c1".to_string(),
            user_id: String::new(),
            is_typing,
        };
        hub.handle_frame(&alice, frame_of(FrameType::Typing, &typing(true))).await;
        hub.handle_frame(&alice, frame_of(FrameType::Typing, &typing(false))).await;
        hub.handle_frame(&alice, frame_of(FrameType::Typing, &typing(false))).await;
        let first = TypingUpdate::try_from(&bob_rx.recv().await.unwrap().payload).unwrap();
        assert!(first.is_typing);
        assert_eq!(first.user_id, "alice");
        let second = TypingUpdate::try_from(&bob_rx.recv().await.unwrap().payload).unwrap();
        assert!(!second.is_typing);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_receipt_notifies_original_senders_once() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, mut alice_rx) = connect(&hub, "alice", 1).await;
        let (bob, _bob_rx) = connect(&hub, "bob", 2).await;
        hub.route_message(&alice, FrameType::Text, text_message("c1", "one")).await;
        hub.route_message(&alice, FrameType::Text, text_message("c1", "two")).await;

        let read = ReadReceipt {
            chat_id: "c1".to_string(),
            reader_id: String::new(),
            up_to: 2,
        };
        hub.handle_frame(&bob, frame_of(FrameType::Read, &read)).await;
        let receipt = alice_rx.recv().await.unwrap();
        assert_eq!(receipt.frame_type, FrameType::Receipt);
        let update = ReceiptUpdate::try_from(&receipt.payload).unwrap();
        assert_eq!(update.reader_id, "bob");
        assert_eq!(update.up_to, 2);

        // A duplicate or older reference changes nothing.
        hub.handle_frame(&bob, frame_of(FrameType::Read, &read)).await;
        let older = ReadReceipt { up_to: 1, ..read };
        hub.handle_frame(&bob, frame_of(FrameType::Read, &older)).await;
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(hub.state().receipts.cursor("c1", "bob").await, Some(2));
    }

    #[tokio::test]
    async fn offer_fans_out_answer_routes_back() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, mut alice_rx) = connect(&hub, "alice", 1).await;
        let (_bob_1, mut bob_1_rx) = connect(&hub, "bob", 2).await;
        let (bob_2, mut bob_2_rx) = connect(&hub, "bob", 3).await;

        let offer = CallOffer {
            call_id: String::new(),
            recipient_id: "bob".to_string(),
            kind: CallKind::Video,
            sdp: serde_json::json!({"type": "offer"}),
            caller_id: String::new(),
        };
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &offer)).await;

        // Both of bob's sessions see the offer.
        let offer_1 = CallOffer::try_from(&bob_1_rx.recv().await.unwrap().payload).unwrap();
        let offer_2 = CallOffer::try_from(&bob_2_rx.recv().await.unwrap().payload).unwrap();
        assert_eq!(offer_1.call_id, offer_2.call_id);
        assert_eq!(offer_1.caller_id, "alice");
        assert!(!offer_1.call_id.is_empty());

        let answer = CallAnswer {
            call_id: offer_1.call_id.clone(),
            sdp: serde_json::json!({"type": "answer"}),
            callee_id: String::new(),
        };
        hub.handle_frame(&bob_2, frame_of(FrameType::CallAnswer, &answer)).await;
        let to_alice = alice_rx.recv().await.unwrap();
        assert_eq!(to_alice.frame_type, FrameType::CallAnswer);
        let routed = CallAnswer::try_from(&to_alice.payload).unwrap();
        assert_eq!(routed.callee_id, "bob");
        // The answer does not echo to bob's first session.
        assert!(bob_1_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_pair_offer_is_rejected_with_one_session() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, mut alice_rx) = connect(&hub, "alice", 1).await;
        let (_bob, mut bob_rx) = connect(&hub, "bob", 2).await;

        let offer = CallOffer {
            call_id: "call-1".to_string(),
            recipient_id: "bob".to_string(),
            kind: CallKind::Voice,
            sdp: serde_json::json!({}),
            caller_id: String::new(),
        };
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &offer)).await;
        assert_eq!(bob_rx.recv().await.unwrap().frame_type, FrameType::CallOffer);

        let second = CallOffer {
            call_id: "call-2".to_string(),
            ..offer
        };
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &second)).await;
        let error = alice_rx.recv().await.unwrap();
        assert_eq!(error.frame_type, FrameType::Error);
        assert_eq!(
            error.payload.properties.get("error").and_then(|v| v.as_str()),
            Some("invalid-call-state")
        );
        // No second offer reached bob.
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offer_to_offline_callee_fails_without_session() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, mut alice_rx) = connect(&hub, "alice", 1).await;
        let offer = CallOffer {
            call_id: String::new(),
            recipient_id: "bob".to_string(),
            kind: CallKind::Voice,
            sdp: serde_json::json!({}),
            caller_id: String::new(),
        };
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &offer)).await;
        let error = alice_rx.recv().await.unwrap();
        assert_eq!(
            error.payload.properties.get("error").and_then(|v| v.as_str()),
            Some("callee-offline")
        );
        // Nothing dangles: the same pair can be offered again later.
        let (_bob, mut bob_rx) = connect(&hub, "bob", 2).await;
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &offer)).await;
        assert_eq!(bob_rx.recv().await.unwrap().frame_type, FrameType::CallOffer);
    }

    #[tokio::test]
    async fn late_ice_candidate_is_dropped_silently() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, _alice_rx) = connect(&hub, "alice", 1).await;
        let (bob, mut bob_rx) = connect(&hub, "bob", 2).await;

        let offer = CallOffer {
            call_id: "call-1".to_string(),
            recipient_id: "bob".to_string(),
            kind: CallKind::Voice,
            sdp: serde_json::json!({}),
            caller_id: String::new(),
        };
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &offer)).await;
        bob_rx.recv().await.unwrap();

        let candidate = IceCandidate {
            call_id: "call-1".to_string(),
            candidate: serde_json::json!({"candidate": "..."}),
            sender_id: String::new(),
        };
        hub.handle_frame(&alice, frame_of(FrameType::IceCandidate, &candidate)).await;
        assert_eq!(bob_rx.recv().await.unwrap().frame_type, FrameType::IceCandidate);

        let end = CallEnd {
            call_id: "call-1".to_string(),
            reason: CallEndReason::Hangup,
        };
        hub.handle_frame(&bob, frame_of(FrameType::CallEnd, &end)).await;
        hub.handle_frame(&alice, frame_of(FrameType::IceCandidate, &candidate)).await;
        // No forwarded frame and no error for the late candidate.
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_force_ends_calls_for_last_session() {
        let (hub, store) = hub_with_store().await;
        store.add_conversation("c1", &["alice", "bob"], false).await;
        let (alice, mut alice_rx) = connect(&hub, "alice", 1).await;
        let (bob, mut bob_rx) = connect(&hub, "bob", 2).await;

        let offer = CallOffer {
            call_id: "call-1".to_string(),
            recipient_id: "bob".to_string(),
            kind: CallKind::Voice,
            sdp: serde_json::json!({}),
            caller_id: String::new(),
        };
        hub.handle_frame(&alice, frame_of(FrameType::CallOffer, &offer)).await;
        bob_rx.recv().await.unwrap();

        hub.disconnect(&bob.session_id).await;
        // Alice observes the teardown exactly once, then the status
        // delta for bob going offline.
        let mut saw_end = false;
        let mut saw_status = false;
        while let Ok(frame) = alice_rx.try_recv() {
            match frame.frame_type {
                FrameType::CallEnd => {
                    assert!(!saw_end);
                    let end = CallEnd::try_from(&frame.payload).unwrap();
                    assert_eq!(end.reason, CallEndReason::PeerDisconnected);
                    saw_end = true;
                }
                FrameType::Status => saw_status = true,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(saw_end);
        assert!(saw_status);
        // The pair is free again.
        drop(alice);
    }

    #[tokio::test]
    async fn duplicate_connection_is_refused_at_connect() {
        let (hub, store) = hub_with_store().await;
        store.add_user("alice").await;
        let (tx, _rx) = mpsc::channel(4);
        hub.connect("alice", 9, tx).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        assert!(matches!(
            hub.connect("alice", 9, tx).await,
            Err(HubError::AlreadyRegistered)
        ));
    }
}
