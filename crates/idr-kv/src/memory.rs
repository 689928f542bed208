use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::{KvEntry, KvError, KvStore};

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    /// Store-wide counter; every write takes the next value.
    last_revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.last_revision += 1;
        self.last_revision
    }
}

/// Revisioned in-memory store.
///
/// Revisions come from one store-wide counter, so a rewritten key always ends
/// up with a strictly higher revision than it had before.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<Inner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a raw payload (including deliberately malformed ones).
    /// Returns the revision assigned.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> u64 {
        let mut inner = self.lock();
        let rev = inner.next_revision();
        inner.entries.insert(key.into(), (value.into(), rev));
        rev
    }

    /// Current value and revision of `key`.
    pub fn get_raw(&self, key: &str) -> Option<(Vec<u8>, u64)> {
        self.lock().entries.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<KvEntry>, KvError> {
        let inner = self.lock();
        Ok(keys
            .iter()
            .map(|k| match inner.entries.get(k) {
                Some((value, rev)) => KvEntry {
                    key: k.clone(),
                    found: true,
                    value: value.clone(),
                    revision: *rev,
                },
                None => KvEntry::missing(k.clone()),
            })
            .collect())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            return Err(KvError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let rev = inner.next_revision();
        inner.entries.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
    ) -> Result<u64, KvError> {
        let mut inner = self.lock();
        let actual = inner.entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if actual != expected_revision || actual == 0 {
            return Err(KvError::Conflict {
                key: key.to_string(),
                expected: expected_revision,
                actual,
            });
        }
        let rev = inner.next_revision();
        inner.entries.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        let mut inner = self.lock();
        let rev = inner.next_revision();
        inner.entries.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.lock().entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_get_reports_missing_keys() {
        let kv = MemoryKvStore::new();
        kv.insert_raw("a", b"1".to_vec());

        let got = kv
            .batch_get(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().any(|e| e.key == "a" && e.found && e.value == b"1"));
        assert!(got.iter().any(|e| e.key == "b" && !e.found && e.revision == 0));
    }

    #[tokio::test]
    async fn update_requires_current_revision() {
        let kv = MemoryKvStore::new();
        let r1 = kv.put_if_absent("k", b"v1".to_vec()).await.unwrap();

        let err = kv.update("k", b"v2".to_vec(), r1 + 7).await.unwrap_err();
        assert!(matches!(err, KvError::Conflict { actual, .. } if actual == r1));

        let r2 = kv.update("k", b"v2".to_vec(), r1).await.unwrap();
        assert!(r2 > r1);
        assert_eq!(kv.get_raw("k"), Some((b"v2".to_vec(), r2)));
    }

    #[tokio::test]
    async fn put_if_absent_refuses_existing_key() {
        let kv = MemoryKvStore::new();
        kv.put_if_absent("k", b"v1".to_vec()).await.unwrap();
        let err = kv.put_if_absent("k", b"v2".to_vec()).await.unwrap_err();
        assert_eq!(
            err,
            KvError::AlreadyExists {
                key: "k".to_string()
            }
        );
    }

    #[tokio::test]
    async fn update_of_missing_key_conflicts() {
        let kv = MemoryKvStore::new();
        let err = kv.update("nope", b"v".to_vec(), 0).await.unwrap_err();
        assert!(matches!(err, KvError::Conflict { actual: 0, .. }));
    }
}
