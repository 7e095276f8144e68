//! Request idempotency cache.
//!
//! A request carrying `idempotencyKey` stores its final payload; a repeat
//! of the same key inside the window replays the cached result instead of
//! re-executing the handler.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

pub struct IdempotencyCache {
    window: Duration,
    entries: DashMap<String, (Instant, Value)>,
}

impl IdempotencyCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: DashMap::new(),
        }
    }

    /// Cached result for `key`, if still inside the window.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        let (stored_at, value) = entry.value();
        if stored_at.elapsed() <= self.window {
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: &str, value: Value) {
        self.entries
            .insert(key.to_string(), (Instant::now(), value));
        self.prune();
    }

    fn prune(&self) {
        self.entries
            .retain(|_, (stored_at, _)| stored_at.elapsed() <= self.window);
    }
}
