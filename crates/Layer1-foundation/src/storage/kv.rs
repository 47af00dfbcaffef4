//! Key-value persistence contract
//!
//! Task/Workflow/SubTask/Allocation 레코드를 id 키로 저장합니다.
//! 상태 전이는 compare-and-swap 쓰기로 커밋됩니다.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Well-known key prefixes
pub mod keys {
    pub const TASK: &str = "task/";
    pub const WORKFLOW: &str = "workflow/";
    pub const OBJECTIVE: &str = "objective/";
    pub const SUBTASK: &str = "subtask/";
    pub const ALLOCATION: &str = "allocation/";

    pub fn task(id: impl std::fmt::Display) -> String {
        format!("{TASK}{id}")
    }

    pub fn workflow(id: impl std::fmt::Display) -> String {
        format!("{WORKFLOW}{id}")
    }

    pub fn objective(id: impl std::fmt::Display) -> String {
        format!("{OBJECTIVE}{id}")
    }

    pub fn subtask(id: impl std::fmt::Display) -> String {
        format!("{SUBTASK}{id}")
    }

    pub fn allocation(id: impl std::fmt::Display) -> String {
        format!("{ALLOCATION}{id}")
    }
}

/// A stored value with its version. Version 0 means "absent".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub version: u64,
    pub value: serde_json::Value,
}

/// Technology-agnostic record store
pub trait KvStore: Send + Sync {
    /// Store name (for logs)
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Unconditional write; returns the new version
    fn put(&self, key: &str, value: serde_json::Value) -> Result<u64>;

    /// Write only if the current version equals `expected` (0 = key must not exist).
    /// Returns the new version, or `Error::Conflict`.
    fn compare_and_swap(&self, key: &str, expected: u64, value: serde_json::Value) -> Result<u64>;

    fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;
}

// ============================================================================
// Typed helpers
// ============================================================================

/// Load and deserialize a record
pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<(u64, T)>> {
    match store.get(key)? {
        Some(v) => Ok(Some((v.version, serde_json::from_value(v.value)?))),
        None => Ok(None),
    }
}

/// Serialize and CAS-write a record
pub fn cas_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    expected: u64,
    record: &T,
) -> Result<u64> {
    store.compare_and_swap(key, expected, serde_json::to_value(record)?)
}

/// Serialize and write a record unconditionally
pub fn put_json<T: Serialize>(store: &dyn KvStore, key: &str, record: &T) -> Result<u64> {
    store.put(key, serde_json::to_value(record)?)
}

/// Deserialize every record under a prefix
pub fn scan_json<T: DeserializeOwned>(store: &dyn KvStore, prefix: &str) -> Result<Vec<(u64, T)>> {
    store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(_, v)| Ok((v.version, serde_json::from_value(v.value)?)))
        .collect()
}

// ============================================================================
// MemoryKvStore
// ============================================================================

/// In-process store (tests, embedding without durability)
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Versioned>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Versioned>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }
}

impl KvStore for MemoryKvStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: serde_json::Value) -> Result<u64> {
        let mut entries = self.lock()?;
        let version = entries.get(key).map(|v| v.version).unwrap_or(0) + 1;
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    fn compare_and_swap(&self, key: &str, expected: u64, value: serde_json::Value) -> Result<u64> {
        let mut entries = self.lock()?;
        let actual = entries.get(key).map(|v| v.version).unwrap_or(0);
        if actual != expected {
            return Err(Error::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        let version = actual + 1;
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let entries = self.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cas_rejects_stale_version() {
        let store = MemoryKvStore::new();
        let v1 = store.compare_and_swap("task/a", 0, json!({"status": "pending"})).unwrap();
        assert_eq!(v1, 1);

        let v2 = store.compare_and_swap("task/a", 1, json!({"status": "assigned"})).unwrap();
        assert_eq!(v2, 2);

        let err = store
            .compare_and_swap("task/a", 1, json!({"status": "running"}))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_create_only_when_absent() {
        let store = MemoryKvStore::new();
        store.put("task/a", json!(1)).unwrap();
        assert!(store.compare_and_swap("task/a", 0, json!(2)).is_err());
    }

    #[test]
    fn test_scan_prefix_is_scoped() {
        let store = MemoryKvStore::new();
        store.put("task/1", json!(1)).unwrap();
        store.put("task/2", json!(2)).unwrap();
        store.put("workflow/1", json!(3)).unwrap();

        let tasks = store.scan_prefix(keys::TASK).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|(k, _)| k.starts_with("task/")));
    }

    #[test]
    fn test_typed_helpers() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Rec {
            n: u32,
        }

        let store = MemoryKvStore::new();
        let v = cas_json(&store, "r/1", 0, &Rec { n: 7 }).unwrap();
        let (version, rec): (u64, Rec) = load_json(&store, "r/1").unwrap().unwrap();
        assert_eq!(version, v);
        assert_eq!(rec, Rec { n: 7 });
        assert!(load_json::<Rec>(&store, "r/2").unwrap().is_none());
    }
}
