//! Session-scoped recovery state.
//!
//! Recovery entries survive page reloads within a browsing session and let a
//! fresh editor instance find the record it was last saved to.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use super::{IdentityError, IdentityResult};

/// Suffix of the entry that always points at the most recent save
pub const LATEST_SUFFIX: &str = "latest";

/// Hex characters kept from the business-name digest
const BUSINESS_KEY_LEN: usize = 16;

/// String key-value storage scoped to one browsing session
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: String) -> IdentityResult<()>;

    fn remove(&self, key: &str);

    /// All keys starting with `prefix`
    fn keys(&self, prefix: &str) -> Vec<String>;
}

/// Stored under a recovery key after every successful save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPayload {
    pub id: String,
    pub business_name_key: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl RecoveryPayload {
    pub fn new(id: impl Into<String>, business_name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            business_name_key: business_name.map(business_name_key),
            saved_at: Utc::now(),
        }
    }
}

/// Stable short key for a business name: whitespace-collapsed, lowercased,
/// SHA-256, first 16 hex characters.
pub fn business_name_key(name: &str) -> String {
    let normalized = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(BUSINESS_KEY_LEN);
    key
}

pub fn business_key_entry(prefix: &str, business_key: &str) -> String {
    format!("{}{}", prefix, business_key)
}

pub fn latest_entry(prefix: &str) -> String {
    format!("{}{}", prefix, LATEST_SUFFIX)
}

/// Decode a recovery entry; unreadable entries are dropped from the store
pub fn read_payload(store: &dyn SessionStore, key: &str) -> Option<RecoveryPayload> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(payload) => Some(payload),
        Err(e) => {
            debug!(key, error = %e, "Discarding unreadable recovery entry");
            store.remove(key);
            None
        }
    }
}

pub fn write_payload(
    store: &dyn SessionStore,
    key: &str,
    payload: &RecoveryPayload,
) -> IdentityResult<()> {
    let raw = serde_json::to_string(payload).map_err(|e| IdentityError::Session(e.to_string()))?;
    store.put(key, raw)
}

/// Process-local session store
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn put(&self, key: &str, value: String) -> IdentityResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}
