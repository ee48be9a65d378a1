use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;

static GLOBAL_ABORTS: Lazy<Arc<AbortRegistry>> = Lazy::new(Arc::default);

/// Aborts older than this are dropped when a new one is recorded.
const ABORT_RETENTION_MINUTES: i64 = 10;

/// Latest external abort per conversation. A round compares its start time
/// against it after every event.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    aborts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AbortRegistry {
    pub fn global() -> Arc<AbortRegistry> {
        Arc::clone(&GLOBAL_ABORTS)
    }

    pub fn abort(&self, conversation_id: &str) {
        self.abort_at(conversation_id, Utc::now());
    }

    pub fn abort_at(&self, conversation_id: &str, at: DateTime<Utc>) {
        let mut aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        let horizon = Utc::now() - Duration::minutes(ABORT_RETENTION_MINUTES);
        aborts.retain(|_, recorded| *recorded > horizon);
        let entry = aborts.entry(conversation_id.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn latest(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        let aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        aborts.get(conversation_id).copied()
    }

    pub fn aborted_since(&self, conversation_id: &str, since: DateTime<Utc>) -> bool {
        self.latest(conversation_id).is_some_and(|at| at > since)
    }

    pub fn clear(&self, conversation_id: &str) {
        let mut aborts = self.aborts.lock().unwrap_or_else(|e| e.into_inner());
        aborts.remove(conversation_id);
    }

    pub fn len(&self) -> usize {
        self.aborts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
