//! Per-page-session key/value storage.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Session-scoped storage. Values live as long as the page session.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    fn remove(&self, key: &str) -> Option<String>;
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.lock().remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = MemorySessionStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("fcmToken"), None);

        store.set("fcmToken", "abc".to_string());
        store.set("fcmToken", "def".to_string());
        assert_eq!(store.get("fcmToken").as_deref(), Some("def"));
        assert_eq!(store.len(), 1);

        assert_eq!(store.remove("fcmToken").as_deref(), Some("def"));
        assert!(store.is_empty());
    }
}
