use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use idr_identity::{build_keys, build_record, key_path, prioritize_keys, DEFAULT_NAMESPACE};
use idr_kv::{KvError, KvStore};
use idr_schemas::{meta, sources, CanonicalRecord, DeviceUpdate, RecordCodecError};

// ---------------------------------------------------------------------------
// Settings / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub namespace: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total time one key may spend retrying before giving up.
    pub max_elapsed: Duration,
    pub multiplier: f64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(750),
            max_elapsed: Duration::from_secs(5),
            multiplier: 1.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Record could not be encoded, or the stored copy could not be decoded.
    Codec { key: String, source: RecordCodecError },
    /// Non-retryable store failure.
    Store { key: String, source: KvError },
    /// Retryable failures persisted past the retry budget.
    RetriesExhausted {
        key: String,
        attempts: u32,
        last: KvError,
    },
    Cancelled,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Codec { key, source } => write!(f, "publish {key}: {source}"),
            PublishError::Store { key, source } => write!(f, "publish {key}: {source}"),
            PublishError::RetriesExhausted {
                key,
                attempts,
                last,
            } => write!(
                f,
                "publish {key}: gave up after {attempts} attempts (last error: {last})"
            ),
            PublishError::Cancelled => write!(f, "publish cancelled"),
        }
    }
}

impl std::error::Error for PublishError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyWrite {
    Created,
    Updated,
    Unchanged,
    /// The key already maps to `owner`, a different canonical device. Left
    /// untouched; keys are never re-pointed by a publish.
    Held { owner: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Keys left alone because another canonical device holds them.
    pub held: usize,
    /// Updates never published (retractions, sweep results, no device id).
    pub skipped: usize,
    pub failed: usize,
    pub first_error: Option<PublishError>,
}

impl PublishReport {
    fn record(&mut self, result: Result<KeyWrite, PublishError>) {
        match result {
            Ok(KeyWrite::Created) => self.created += 1,
            Ok(KeyWrite::Updated) => self.updated += 1,
            Ok(KeyWrite::Unchanged) => self.unchanged += 1,
            Ok(KeyWrite::Held { .. }) => self.held += 1,
            Err(e) => {
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(e);
                }
            }
        }
    }
}

/// Updates that must never become canonical records.
pub fn skip_publish(update: &DeviceUpdate) -> bool {
    update.device_id.trim().is_empty()
        || update.source == sources::SWEEP
        || meta::is_deleted(&update.metadata)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Writes canonical records at every identity-key path of a device.
///
/// Writes are optimistic: the revision is re-read right before each attempt,
/// then the key is created-if-absent or updated at that revision. Records are
/// never deleted, and a key held by one canonical device is never handed to
/// another.
pub struct CanonicalPublisher<S> {
    store: S,
    settings: PublisherSettings,
    span: tracing::Span,
}

impl<S: KvStore> CanonicalPublisher<S> {
    pub fn new(store: S, settings: PublisherSettings) -> Self {
        let span = tracing::info_span!("canonical_publisher", namespace = %settings.namespace);
        Self::with_span(store, settings, span)
    }

    pub fn with_span(store: S, settings: PublisherSettings, span: tracing::Span) -> Self {
        Self {
            store,
            settings,
            span,
        }
    }

    /// Publish every eligible update. Failures on one key do not stop the
    /// remaining keys; the first is kept in the report.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        updates: &[DeviceUpdate],
        now: DateTime<Utc>,
    ) -> PublishReport {
        async {
            let mut report = PublishReport::default();
            for update in updates {
                if skip_publish(update) {
                    report.skipped += 1;
                    continue;
                }
                let record = build_record(update, now);
                for key in prioritize_keys(build_keys(update)) {
                    let path = key_path(&key, &self.settings.namespace);
                    report.record(self.upsert(cancel, &path, &record).await);
                }
            }

            if let Some(err) = &report.first_error {
                tracing::warn!(
                    operation = "publish",
                    failed = report.failed,
                    error = %err,
                    "canonical publish incomplete"
                );
            }
            tracing::debug!(
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                skipped = report.skipped,
                "canonical publish complete"
            );
            report
        }
        .instrument(self.span.clone())
        .await
    }

    /// Write `record` at `path`, retrying conflicts and transient failures
    /// with bounded exponential backoff.
    pub async fn upsert(
        &self,
        cancel: &CancellationToken,
        path: &str,
        record: &CanonicalRecord,
    ) -> Result<KeyWrite, PublishError> {
        let payload = record.encode().map_err(|source| PublishError::Codec {
            key: path.to_string(),
            source,
        })?;

        let started = tokio::time::Instant::now();
        let mut delay = self.settings.initial_backoff;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(PublishError::Cancelled);
            }
            attempts += 1;

            let err = match self.attempt(path, record, &payload).await {
                Ok(write) => return Ok(write),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retry(e)) => e,
            };

            if started.elapsed() + delay > self.settings.max_elapsed {
                tracing::warn!(key = %path, attempts, error = %err, "canonical publish exhausted retries");
                return Err(PublishError::RetriesExhausted {
                    key: path.to_string(),
                    attempts,
                    last: err,
                });
            }
            tracing::debug!(key = %path, attempts, error = %err, "canonical publish retrying");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay
                .mul_f64(self.settings.multiplier.max(1.0))
                .min(self.settings.max_backoff);
        }
    }

    async fn attempt(
        &self,
        path: &str,
        record: &CanonicalRecord,
        payload: &[u8],
    ) -> Result<KeyWrite, AttemptError> {
        let keys = [path.to_string()];
        let current = self
            .store
            .batch_get(&keys)
            .await
            .map_err(|e| AttemptError::classify(path, e))?
            .into_iter()
            .find(|e| e.key == path && e.found);

        let Some(current) = current else {
            return self
                .store
                .put_if_absent(path, payload.to_vec())
                .await
                .map(|_| KeyWrite::Created)
                .map_err(|e| AttemptError::classify(path, e));
        };

        let existing = CanonicalRecord::decode(&current.value).map_err(|source| {
            AttemptError::Fatal(PublishError::Codec {
                key: path.to_string(),
                source,
            })
        })?;
        if existing.same_identity(record) {
            return Ok(KeyWrite::Unchanged);
        }
        if existing.canonical_device_id != record.canonical_device_id {
            tracing::warn!(
                key = %path,
                operation = "publish",
                owner = %existing.canonical_device_id,
                refused = %record.canonical_device_id,
                "identity key held by another canonical device; not re-pointed"
            );
            return Ok(KeyWrite::Held {
                owner: existing.canonical_device_id,
            });
        }

        self.store
            .update(path, payload.to_vec(), current.revision)
            .await
            .map(|_| KeyWrite::Updated)
            .map_err(|e| AttemptError::classify(path, e))
    }
}

enum AttemptError {
    Retry(KvError),
    Fatal(PublishError),
}

impl AttemptError {
    fn classify(path: &str, e: KvError) -> Self {
        match e {
            KvError::Cancelled => AttemptError::Fatal(PublishError::Cancelled),
            e if e.is_retryable() => AttemptError::Retry(e),
            e => AttemptError::Fatal(PublishError::Store {
                key: path.to_string(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idr_kv::MemoryKvStore;

    fn update(id: &str) -> DeviceUpdate {
        let mut u = DeviceUpdate::observed(sources::NETBOX, "dc1", "10.2.0.1", Utc::now());
        u.device_id = id.to_string();
        u.hostname = Some("nb-host".to_string());
        u
    }

    #[test]
    fn skips_retractions_sweeps_and_anonymous_updates() {
        let mut u = update("sr:1");
        assert!(!skip_publish(&u));

        u.metadata
            .insert(meta::DELETED.to_string(), "true".to_string());
        assert!(skip_publish(&u));

        let anon = update(" ");
        assert!(skip_publish(&anon));

        let mut sweep = update("sr:2");
        sweep.source = sources::SWEEP.to_string();
        assert!(skip_publish(&sweep));
    }

    #[tokio::test]
    async fn second_publish_of_same_state_is_unchanged() {
        let kv = MemoryKvStore::new();
        let publisher = CanonicalPublisher::new(&kv, PublisherSettings::default());
        let cancel = CancellationToken::new();
        let now = Utc::now();

        let first = publisher.publish(&cancel, &[update("sr:1")], now).await;
        assert_eq!(first.created, 2, "ip + hostname paths");
        assert!(first.first_error.is_none());

        let second = publisher
            .publish(&cancel, &[update("sr:1")], now + chrono::Duration::minutes(5))
            .await;
        assert_eq!(second.unchanged, 2);
        assert_eq!(second.created + second.updated, 0);
    }

    #[tokio::test]
    async fn changed_state_updates_at_higher_revision() {
        let kv = MemoryKvStore::new();
        let publisher = CanonicalPublisher::new(&kv, PublisherSettings::default());
        let cancel = CancellationToken::new();

        publisher.publish(&cancel, &[update("sr:1")], Utc::now()).await;
        let path = "device_canonical_map/ip/10.2.0.1";
        let (_, before) = kv.get_raw(path).unwrap();

        let mut changed = update("sr:1");
        changed
            .metadata
            .insert(meta::INTEGRATION_ID.to_string(), "5".to_string());
        let report = publisher.publish(&cancel, &[changed], Utc::now()).await;
        assert!(report.updated >= 2);

        let (_, after) = kv.get_raw(path).unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn malformed_stored_copy_is_not_overwritten() {
        let kv = MemoryKvStore::new();
        kv.insert_raw("device_canonical_map/ip/10.2.0.1", b"garbage".to_vec());
        let publisher = CanonicalPublisher::new(&kv, PublisherSettings::default());

        let report = publisher
            .publish(&CancellationToken::new(), &[update("sr:1")], Utc::now())
            .await;
        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.first_error,
            Some(PublishError::Codec { .. })
        ));
        assert_eq!(
            kv.get_raw("device_canonical_map/ip/10.2.0.1").unwrap().0,
            b"garbage".to_vec()
        );
    }

    #[tokio::test]
    async fn key_held_by_another_device_is_not_repointed() {
        let kv = MemoryKvStore::new();
        let publisher = CanonicalPublisher::new(&kv, PublisherSettings::default());
        let cancel = CancellationToken::new();
        let path = "device_canonical_map/ip/10.2.0.1";

        publisher.publish(&cancel, &[update("sr:owner")], Utc::now()).await;
        let (_, rev) = kv.get_raw(path).unwrap();

        let report = publisher.publish(&cancel, &[update("sr:newcomer")], Utc::now()).await;
        assert_eq!(report.held, 2, "ip + hostname paths");
        assert_eq!(report.created + report.updated, 0);
        assert!(report.first_error.is_none());

        let (bytes, after) = kv.get_raw(path).unwrap();
        assert_eq!(after, rev);
        assert_eq!(
            CanonicalRecord::decode(&bytes).unwrap().canonical_device_id,
            "sr:owner"
        );

        let record = build_record(&update("sr:newcomer"), Utc::now());
        assert_eq!(
            publisher.upsert(&cancel, path, &record).await.unwrap(),
            KeyWrite::Held {
                owner: "sr:owner".to_string()
            }
        );
    }
}
