// src/core/repair_limiter.rs
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RepairAttempt {
    pub attempt_count: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Bounds retries of one repair per entity inside a cooldown window.
#[derive(Debug, Default)]
pub struct RepairLimiter {
    attempts: Mutex<HashMap<(String, String), RepairAttempt>>,
}

impl RepairLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_attempt(
        &self,
        entity_id: &str,
        action: &str,
        max_attempts: u32,
        cooldown_minutes: i64,
    ) -> bool {
        self.should_attempt_at(entity_id, action, max_attempts, cooldown_minutes, Utc::now())
    }

    /// Records an attempt if one is allowed. Refuses once `max_attempts` were
    /// made inside the current window; the window restarts after it elapses.
    pub fn should_attempt_at(
        &self,
        entity_id: &str,
        action: &str,
        max_attempts: u32,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let cooldown = Duration::minutes(cooldown_minutes);
        let mut attempts = self.attempts.lock();
        let entry = attempts
            .entry((entity_id.to_string(), action.to_string()))
            .or_insert(RepairAttempt {
                attempt_count: 0,
                first_attempt_at: now,
                last_attempt_at: now,
            });

        if now - entry.first_attempt_at >= cooldown {
            entry.attempt_count = 0;
            entry.first_attempt_at = now;
        }

        if entry.attempt_count >= max_attempts.max(1) {
            warn!(
                entity = entity_id,
                action,
                attempts = entry.attempt_count,
                "repair budget exhausted until cooldown ends"
            );
            return false;
        }

        entry.attempt_count += 1;
        entry.last_attempt_at = now;
        true
    }

    /// Call after a verified fix so old failures do not block future repairs.
    pub fn clear(&self, entity_id: &str, action: &str) {
        self.attempts
            .lock()
            .remove(&(entity_id.to_string(), action.to_string()));
    }

    pub fn clear_entity(&self, entity_id: &str) {
        self.attempts.lock().retain(|(id, _), _| id != entity_id);
    }

    pub fn attempts(&self, entity_id: &str, action: &str) -> u32 {
        self.attempts
            .lock()
            .get(&(entity_id.to_string(), action.to_string()))
            .map(|a| a.attempt_count)
            .unwrap_or(0)
    }
}
