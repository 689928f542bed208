//! idr-kv
//!
//! Key-value store boundary used by the canonical resolver, the canonical
//! publisher and derived config writes.
//!
//! The store itself is an external collaborator. This crate owns only:
//! - the [`KvStore`] trait and its entry / error types,
//! - [`MemoryKvStore`], a revisioned in-process implementation used by tests
//!   and single-node wiring.

mod memory;

pub use memory::MemoryKvStore;

use std::fmt;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One result row of [`KvStore::batch_get`].
///
/// Result order is unspecified. Callers index by `key`, never by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub found: bool,
    pub value: Vec<u8>,
    /// Monotonic per-key counter for optimistic concurrency. 0 when absent.
    pub revision: u64,
}

impl KvEntry {
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            found: false,
            value: Vec::new(),
            revision: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Store unreachable or transport failure.
    Unavailable(String),
    /// The request was too large for the store; smaller batches may succeed.
    ResourceExhausted { requested: usize },
    /// Update lost an optimistic-concurrency race.
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },
    /// Create-if-absent found an existing value.
    AlreadyExists { key: String },
    /// Caller cancelled before the store answered.
    Cancelled,
    Other(String),
}

impl KvError {
    /// Worth retrying after re-reading the key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvError::Unavailable(_)
                | KvError::ResourceExhausted { .. }
                | KvError::Conflict { .. }
                | KvError::AlreadyExists { .. }
        )
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Unavailable(msg) => write!(f, "kv unavailable: {msg}"),
            KvError::ResourceExhausted { requested } => {
                write!(f, "kv resource exhausted (requested {requested} keys)")
            }
            KvError::Conflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "kv revision conflict on {key}: expected {expected}, found {actual}"
            ),
            KvError::AlreadyExists { key } => write!(f, "kv key already exists: {key}"),
            KvError::Cancelled => write!(f, "kv request cancelled"),
            KvError::Other(msg) => write!(f, "kv error: {msg}"),
        }
    }
}

impl std::error::Error for KvError {}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Remote key-value store contract.
///
/// Implementations must be `Send + Sync`; the resolver dispatches chunked
/// lookups concurrently against one shared handle.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Look up many keys in one call. Every requested key appears in the
    /// result, with `found == false` when absent.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<KvEntry>, KvError>;

    /// Create `key` only if it does not exist. Returns the new revision.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Replace `key` only if its revision is still `expected_revision`.
    /// Returns the new revision.
    async fn update(&self, key: &str, value: Vec<u8>, expected_revision: u64)
        -> Result<u64, KvError>;

    /// Unconditional write, used for derived config documents.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Unconditional delete, used for derived config documents.
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[async_trait::async_trait]
impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<KvEntry>, KvError> {
        (**self).batch_get(keys).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        (**self).put_if_absent(key, value).await
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
    ) -> Result<u64, KvError> {
        (**self).update(key, value, expected_revision).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        (**self).delete(key).await
    }
}

#[async_trait::async_trait]
impl<T: KvStore + ?Sized> KvStore for &T {
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<KvEntry>, KvError> {
        (**self).batch_get(keys).await
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        (**self).put_if_absent(key, value).await
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
    ) -> Result<u64, KvError> {
        (**self).update(key, value, expected_revision).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        (**self).delete(key).await
    }
}
