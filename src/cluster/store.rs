use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// A stored value with its version stamp.
#[derive(Debug, Clone, Serialize)]
pub struct VersionedValue {
    pub data: Vec<u8>,
    pub ts: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, VersionedValue>,
    version_counter: u64,
}

/// In-memory versioned key-value store. All operations serialize through one
/// lock; versions are strictly monotonic within a node and never reused.
#[derive(Debug, Default)]
pub struct KvStore {
    state: RwLock<StoreState>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<VersionedValue> {
        self.state.read().await.entries.get(key).cloned()
    }

    /// Current version of a key; 0 denotes "not present".
    pub async fn get_version(&self, key: &str) -> u64 {
        self.state
            .read()
            .await
            .entries
            .get(key)
            .map(|v| v.version)
            .unwrap_or(0)
    }

    /// Write an entry under the next version and return it.
    pub async fn put(&self, key: &str, data: Vec<u8>) -> u64 {
        let mut state = self.state.write().await;
        state.version_counter += 1;
        let version = state.version_counter;
        state.entries.insert(
            key.to_string(),
            VersionedValue {
                data,
                ts: Utc::now(),
                version,
            },
        );
        version
    }

    /// Remove a key; true when a prior entry existed.
    pub async fn delete(&self, key: &str) -> bool {
        self.state.write().await.entries.remove(key).is_some()
    }

    /// Copy of the full map, for bulk sync.
    pub async fn snapshot(&self) -> HashMap<String, VersionedValue> {
        self.state.read().await.entries.clone()
    }

    /// Sorted key listing with optional `prefix*` glob or exact filter.
    pub async fn keys(&self, pattern: Option<&str>) -> Vec<String> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = match pattern {
            None | Some("") => state.entries.keys().cloned().collect(),
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => state
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect(),
                None => state
                    .entries
                    .keys()
                    .filter(|k| k.as_str() == pattern)
                    .cloned()
                    .collect(),
            },
        };
        keys.sort_unstable();
        keys
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}
