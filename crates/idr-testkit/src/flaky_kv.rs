use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use idr_kv::{KvEntry, KvError, KvStore, MemoryKvStore};

#[derive(Default)]
struct Faults {
    /// 1-based `batch_get` calls that fail with `Unavailable`.
    fail_calls: BTreeSet<usize>,
    fail_all: bool,
    /// Larger batches fail with `ResourceExhausted`.
    max_batch: Option<usize>,
    /// `batch_get` never answers; callers must cancel.
    block: bool,
}

/// [`MemoryKvStore`] with injectable `batch_get` faults and call accounting.
/// Writes always go straight to the inner store.
#[derive(Default)]
pub struct FlakyKvStore {
    inner: MemoryKvStore,
    faults: Mutex<Faults>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    blocked: AtomicBool,
}

impl FlakyKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryKvStore {
        &self.inner
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fail_call(&self, n: usize) -> &Self {
        self.faults().fail_calls.insert(n);
        self
    }

    pub fn fail_all(&self, on: bool) -> &Self {
        self.faults().fail_all = on;
        self
    }

    pub fn max_batch(&self, max: Option<usize>) -> &Self {
        self.faults().max_batch = max;
        self
    }

    pub fn block(&self, on: bool) -> &Self {
        self.faults().block = on;
        self
    }

    /// `batch_get` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requested key count of every `batch_get` call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Some call blocked waiting for cancellation.
    pub fn was_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for FlakyKvStore {
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<KvEntry>, KvError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batch_sizes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(keys.len());

        let (fail, too_big, block) = {
            let f = self.faults();
            (
                f.fail_all || f.fail_calls.contains(&n),
                f.max_batch.is_some_and(|max| keys.len() > max),
                f.block,
            )
        };
        if fail {
            return Err(KvError::Unavailable(format!("injected failure on call {n}")));
        }
        if too_big {
            return Err(KvError::ResourceExhausted {
                requested: keys.len(),
            });
        }
        if block {
            self.blocked.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        self.inner.batch_get(keys).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        self.inner.put_if_absent(key, value).await
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected_revision: u64) -> Result<u64, KvError> {
        self.inner.update(key, value, expected_revision).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.delete(key).await
    }
}
