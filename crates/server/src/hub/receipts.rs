use std::collections::HashMap;
use tokio::sync::Mutex;

/// Monotonic read cursors, one per (chat, reader). Out-of-order and
/// duplicate read events never regress a cursor.
#[derive(Default)]
pub struct ReadTracker {
    cursors: Mutex<HashMap<(String, String), u64>>,
}

impl ReadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the cursor if `up_to` is newer than the stored
    /// reference; returns whether it moved.
    pub async fn advance(&self, chat_id: &str, reader_id: &str, up_to: u64) -> bool {
        let mut cursors = self.cursors.lock().await;
        let key = (chat_id.to_string(), reader_id.to_string());
        match cursors.get(&key) {
            Some(current) if *current >= up_to => false,
            _ => {
                cursors.insert(key, up_to);
                true
            }
        }
    }

    pub async fn cursor(&self, chat_id: &str, reader_id: &str) -> Option<u64> {
        let cursors = self.cursors.lock().await;
        cursors
            .get(&(chat_id.to_string(), reader_id.to_string()))
            .copied()
    }
}
