use crate::impl_control_codec;
use serde::{Deserialize, Serialize};

/// First frame on every connection: declares who is connecting.
/// Identity verification itself is the directory's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHello {
    pub user_id: String,
}

/// One chat message. Clients send `chat_id`/`content` (plus
/// `media_url` for media frames); the hub fills `sender_id`,
/// `message_id` and `sent_at` before fan-out and never mutates the
/// frame afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub message_id: Option<u64>,
    #[serde(default)]
    pub sent_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUpdate {
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_typing")]
    pub is_typing: bool,
}

fn default_typing() -> bool {
    true
}

/// Read acknowledgement up to (and including) a message reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub chat_id: String,
    #[serde(default)]
    pub reader_id: String,
    pub up_to: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Hub-emitted aggregate presence delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub status: PresenceStatus,
}

/// Hub-emitted delivered-to-read transition, sent to the original
/// senders of the acknowledged messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptUpdate {
    pub chat_id: String,
    pub reader_id: String,
    pub up_to: u64,
}

impl_control_codec!(SessionHello);
impl_control_codec!(ChatMessage);
impl_control_codec!(TypingUpdate);
impl_control_codec!(ReadReceipt);
impl_control_codec!(PresenceUpdate);
impl_control_codec!(ReceiptUpdate);
