use std::collections::HashMap;
use tokio::sync::Mutex;

/// Tracks the last observed typing state per (chat, user). Typing is
/// ephemeral: nothing here survives the user's last session, and the
/// hub does no debouncing beyond duplicate-stop suppression.
#[derive(Default)]
pub struct PresenceTracker {
    typing: Mutex<HashMap<(String, String), bool>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a typing update and reports whether it should be
    /// forwarded. Only a repeated `is_typing = false` is suppressed;
    /// no recorded state counts as not typing.
    pub async fn should_forward_typing(
        &self,
        chat_id: &str,
        user_id: &str,
        is_typing: bool,
    ) -> bool {
        let mut typing = self.typing.lock().await;
        let key = (chat_id.to_string(), user_id.to_string());
        let previous = typing.insert(key, is_typing).unwrap_or(false);
        is_typing || previous
    }

    /// Drops every typing record for a user who went offline.
    pub async fn clear_user(&self, user_id: &str) {
        let mut typing = self.typing.lock().await;
        typing.retain(|(_, owner), _| owner != user_id);
    }
}
