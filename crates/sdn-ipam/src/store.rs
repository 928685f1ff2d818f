//! Key-value store adapter with value-based compare-and-swap.
//!
//! The cluster store is addressed by a logical store name plus a key. Writes
//! are conditional on the *full previous value* the caller observed, not on a
//! version counter, so two nodes that read the same bytes race on equal terms
//! and exactly one of them wins.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::error::IpamResult;

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The stored value matched the expectation and was replaced.
    Applied,
    /// The stored value changed since it was read.
    Outdated,
}

impl CasOutcome {
    /// Returns true if the write took effect.
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Distributed key-value store consumed by the allocator.
///
/// Errors other than a CAS conflict are reported through `Err`, which gives
/// the tri-state {ok, outdated, other-error} contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a value. `None` means the key has never been written.
    async fn get(&self, store: &str, key: &str) -> IpamResult<Option<Vec<u8>>>;

    /// Reads every value of a store.
    async fn get_all(&self, store: &str) -> IpamResult<Vec<Vec<u8>>>;

    /// Writes `value` if the current value equals `expected`.
    ///
    /// `expected = None` requires the key to be absent.
    async fn put(
        &self,
        store: &str,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
    ) -> IpamResult<CasOutcome>;

    /// Deletes a key, returning whether it existed.
    async fn delete(&self, store: &str, key: &str) -> IpamResult<bool>;
}

/// Process-local store used for standalone nodes and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    stores: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys held in a store.
    pub fn len(&self, store: &str) -> usize {
        self.stores.lock().get(store).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, store: &str, key: &str) -> IpamResult<Option<Vec<u8>>> {
        Ok(self
            .stores
            .lock()
            .get(store)
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn get_all(&self, store: &str) -> IpamResult<Vec<Vec<u8>>> {
        Ok(self
            .stores
            .lock()
            .get(store)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(
        &self,
        store: &str,
        key: &str,
        value: &[u8],
        expected: Option<&[u8]>,
    ) -> IpamResult<CasOutcome> {
        let mut stores = self.stores.lock();
        let records = stores.entry(store.to_string()).or_default();

        if records.get(key).map(Vec::as_slice) != expected {
            return Ok(CasOutcome::Outdated);
        }

        records.insert(key.to_string(), value.to_vec());
        Ok(CasOutcome::Applied)
    }

    async fn delete(&self, store: &str, key: &str) -> IpamResult<bool> {
        Ok(self
            .stores
            .lock()
            .get_mut(store)
            .is_some_and(|records| records.remove(key).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_absent_key_without_expectation() {
        let store = MemoryStore::new();

        let first = store.put("vlan", "vlan", b"a", None).await.unwrap();
        assert_eq!(first, CasOutcome::Applied);

        let second = store.put("vlan", "vlan", b"b", None).await.unwrap();
        assert_eq!(second, CasOutcome::Outdated);
        assert_eq!(store.get("vlan", "vlan").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_put_compares_full_previous_value() {
        let store = MemoryStore::new();
        store.put("ip", "10.1.0.0/24", b"old", None).await.unwrap();

        let stale = store
            .put("ip", "10.1.0.0/24", b"new", Some(b"other"))
            .await
            .unwrap();
        assert!(!stale.is_applied());

        let fresh = store
            .put("ip", "10.1.0.0/24", b"new", Some(b"old"))
            .await
            .unwrap();
        assert!(fresh.is_applied());
        assert_eq!(
            store.get("ip", "10.1.0.0/24").await.unwrap(),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn test_get_all_and_delete() {
        let store = MemoryStore::new();
        store.put("network", "a", b"1", None).await.unwrap();
        store.put("network", "b", b"2", None).await.unwrap();

        assert_eq!(store.get_all("network").await.unwrap().len(), 2);
        assert!(store.delete("network", "a").await.unwrap());
        assert!(!store.delete("network", "a").await.unwrap());
        assert_eq!(store.len("network"), 1);
        assert!(store.get_all("missing").await.unwrap().is_empty());
    }
}
