//! Durable key-value storage backing the trust store and the active config.
//!
//! Both the trust store and the config resolver persist through the
//! [`KeyValueStore`] capability rather than touching files directly, so any
//! durable store satisfies them: the [`TomlFileStore`] used by the binary, the
//! [`MemoryStore`] used in tests, or a platform keychain adapter.
//!
//! # Key layout
//!
//! | Key                      | Value (JSON)              |
//! |--------------------------|---------------------------|
//! | `trust/<bridge_id>`      | `TrustRecord`             |
//! | `provisioning/<bridge_id>` | hex provisioning secret |
//! | `config/active`          | `ActiveServerConfig`      |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod settings;
pub mod toml_store;

pub use toml_store::TomlFileStore;

pub const TRUST_PREFIX: &str = "trust/";
pub const PROVISIONING_PREFIX: &str = "provisioning/";
pub const ACTIVE_CONFIG_KEY: &str = "config/active";

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing file is not valid TOML.
    #[error("failed to parse store file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The backing file could not be written as TOML.
    #[error("failed to serialize store file: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A stored value is not the JSON we expected.
    #[error("corrupt value under {key}: {message}")]
    Corrupt { key: String, message: String },

    /// A lock guarding the store was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    Poisoned,
}

/// Minimal durable string map.
///
/// Implementations must make each `put`/`remove` durable before returning.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Reads and JSON-decodes the value under `key`.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// JSON-encodes `value` and stores it under `key`.
pub fn put_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.put(key, &raw)
}

/// Volatile store for tests and for devices that opt out of persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bridgelink_core::ActiveServerConfig;

    #[test]
    fn test_memory_store_put_get_remove() {
        // Arrange
        let store = MemoryStore::new();

        // Act
        store.put("a", "1").unwrap();

        // Assert
        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_keys_with_prefix_filters() {
        let store = MemoryStore::new();
        store.put("trust/b1", "{}").unwrap();
        store.put("trust/b2", "{}").unwrap();
        store.put("provisioning/b1", "x").unwrap();

        let keys = store.keys_with_prefix(TRUST_PREFIX).unwrap();

        assert_eq!(keys, vec!["trust/b1".to_string(), "trust/b2".to_string()]);
    }

    #[test]
    fn test_json_helpers_round_trip_config() {
        let store = MemoryStore::new();
        let cfg = ActiveServerConfig::default();

        put_json(&store, ACTIVE_CONFIG_KEY, &cfg).unwrap();
        let loaded: Option<ActiveServerConfig> = get_json(&store, ACTIVE_CONFIG_KEY).unwrap();

        assert_eq!(loaded, Some(cfg));
    }

    #[test]
    fn test_get_json_reports_corrupt_value() {
        let store = MemoryStore::new();
        store.put(ACTIVE_CONFIG_KEY, "{not json").unwrap();

        let result: Result<Option<ActiveServerConfig>, _> = get_json(&store, ACTIVE_CONFIG_KEY);

        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }
}
