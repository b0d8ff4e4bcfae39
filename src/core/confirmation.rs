// src/core/confirmation.rs
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationState {
    pub count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_payload: String,
}

/// Debounces repeated detections of the same condition.
///
/// A key is `(entity_id, action)`. Consecutive detections inside the window
/// accumulate; once the count reaches the requirement the key is cleared and
/// the caller may act.
#[derive(Debug)]
pub struct ConfirmationTracker {
    window: Mutex<Duration>,
    entries: Mutex<HashMap<(String, String), ConfirmationState>>,
}

impl ConfirmationTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window: Mutex::new(window),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Applies a changed window to streaks recorded from now on and to open ones.
    pub fn set_window(&self, window: Duration) {
        *self.window.lock() = window;
    }

    pub fn confirm(&self, entity_id: &str, action: &str, payload: &str, required: u32) -> bool {
        self.confirm_at(entity_id, action, payload, required, Utc::now())
    }

    pub fn confirm_at(
        &self,
        entity_id: &str,
        action: &str,
        payload: &str,
        required: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let key = (entity_id.to_string(), action.to_string());
        let window = *self.window.lock();
        let mut entries = self.entries.lock();

        if required <= 1 {
            entries.remove(&key);
            return true;
        }

        let state = entries.entry(key.clone()).or_insert_with(|| ConfirmationState {
            count: 0,
            first_seen_at: now,
            last_payload: String::new(),
        });
        if now - state.first_seen_at > window {
            state.count = 0;
            state.first_seen_at = now;
        }
        state.count += 1;
        state.last_payload = payload.to_string();

        debug!(
            entity = entity_id,
            action,
            count = state.count,
            required,
            "confirmation recorded"
        );

        if state.count >= required {
            entries.remove(&key);
            true
        } else {
            false
        }
    }

    /// Negative detection: the streak for this key starts over.
    pub fn reset(&self, entity_id: &str, action: &str) {
        self.entries
            .lock()
            .remove(&(entity_id.to_string(), action.to_string()));
    }

    /// Drops every streak for an entity, e.g. once its position is closed.
    pub fn clear_entity(&self, entity_id: &str) {
        self.entries.lock().retain(|(id, _), _| id != entity_id);
    }

    pub fn pending(&self, entity_id: &str, action: &str) -> Option<ConfirmationState> {
        self.entries
            .lock()
            .get(&(entity_id.to_string(), action.to_string()))
            .cloned()
    }
}
