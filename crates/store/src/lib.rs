//! Collaborator interfaces the hub depends on but does not own.
//!
//! Conversation membership, message history and user resolution live
//! in external services; the hub consults them through [`ChatStore`]
//! and [`Directory`] and treats the answers as read-mostly reference
//! data, re-resolved on demand. [`MemoryStore`] implements both for
//! tests and standalone runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum StoreError {
    UnknownChat,
    UnknownUser,
    Unavailable,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChat => write!(f, "unknown chat"),
            Self::UnknownUser => write!(f, "unknown user"),
            Self::Unavailable => write!(f, "store unavailable"),
        }
    }
}

impl Error for StoreError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub chat_id: String,
    pub members: HashSet<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub media_url: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: u64,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Message persistence and membership, append-only from the hub's
/// point of view. `message_id` values are monotonic within a chat and
/// double as the read-cursor reference.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;
    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>, StoreError>;
    async fn members(&self, chat_id: &str) -> Result<Conversation, StoreError>;
    async fn mark_read(&self, chat_id: &str, user_id: &str, up_to: u64)
        -> Result<(), StoreError>;
}

/// User resolution and conversation-overlap queries.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_user(&self, user_id: &str) -> Result<(), StoreError>;
    async fn shared_chats(&self, user_a: &str, user_b: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    users: HashSet<String>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<StoredMessage>>,
    next_message_id: u64,
}

/// In-memory implementation of both collaborators.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user_id.to_string());
    }

    pub async fn add_conversation(&self, chat_id: &str, members: &[&str], is_group: bool) {
        let mut inner = self.inner.lock().await;
        for member in members {
            inner.users.insert(member.to_string());
        }
        inner.conversations.insert(
            chat_id.to_string(),
            Conversation {
                chat_id: chat_id.to_string(),
                members: members.iter().map(|m| m.to_string()).collect(),
                is_group,
            },
        );
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.conversations.contains_key(&message.chat_id) {
            return Err(StoreError::UnknownChat);
        }
        inner.next_message_id += 1;
        let stored = StoredMessage {
            message_id: inner.next_message_id,
            chat_id: message.chat_id.clone(),
            sender_id: message.sender_id,
            content: message.content,
            media_url: message.media_url,
            created_at: message.sent_at.unwrap_or_else(Utc::now),
        };
        inner
            .messages
            .entry(message.chat_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn list(&self, chat_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.conversations.contains_key(chat_id) {
            return Err(StoreError::UnknownChat);
        }
        Ok(inner.messages.get(chat_id).cloned().unwrap_or_default())
    }

    async fn members(&self, chat_id: &str) -> Result<Conversation, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .conversations
            .get(chat_id)
            .cloned()
            .ok_or(StoreError::UnknownChat)
    }

    async fn mark_read(
        &self,
        chat_id: &str,
        _user_id: &str,
        _up_to: u64,
    ) -> Result<(), StoreError> {
        let inner = self.inner.lock().await;
        if !inner.conversations.contains_key(chat_id) {
            return Err(StoreError::UnknownChat);
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn resolve_user(&self, user_id: &str) -> Result<(), StoreError> {
        let inner = self.inner.lock().await;
        if inner.users.contains(user_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownUser)
        }
    }

    async fn shared_chats(&self, user_a: &str, user_b: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .conversations
            .values()
            .filter(|conversation| {
                conversation.members.contains(user_a) && conversation.members.contains(user_b)
            })
            .map(|conversation| conversation.chat_id.clone())
            .collect())
    }
}
