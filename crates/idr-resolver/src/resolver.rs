use std::collections::BTreeSet;
use std::fmt;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use idr_identity::{key_path, DEFAULT_NAMESPACE};
use idr_kv::{KvEntry, KvError, KvStore};
use idr_schemas::{CanonicalRecord, IdentityKey};

use crate::chunk::{
    fetch_chunk, merge_chunks, split_chunks, ChunkResult, MergedChunks, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_CONCURRENT_CHUNKS,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    pub namespace: String,
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Canonical record found for a device, with the key that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record: CanonicalRecord,
    /// Revision of the copy stored at `path`.
    pub revision: u64,
    pub key: IdentityKey,
    pub path: String,
}

/// A lower-priority key of the same device that points at a different
/// canonical device than the winning key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConflict {
    pub winner_key: IdentityKey,
    pub winner_device_id: String,
    pub other_key: IdentityKey,
    pub other_device_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceResolution {
    pub hit: Option<Resolution>,
    pub conflicts: Vec<IdentityConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// At least one lookup failed; affected devices resolve as "no match".
    Store(KvError),
    /// The pass was cancelled before every lookup answered.
    Cancelled,
}

impl From<KvError> for ResolveError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Cancelled => ResolveError::Cancelled,
            other => ResolveError::Store(other),
        }
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::Store(e) => write!(f, "canonical lookup degraded: {e}"),
            ResolveError::Cancelled => write!(f, "canonical lookup cancelled"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Result of one [`CanonicalResolver::resolve`] pass. `devices[i]` belongs
/// to the i-th input key list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub devices: Vec<DeviceResolution>,
    /// Set when the pass degraded. Never prevents the partial result.
    pub first_error: Option<ResolveError>,
    pub failed_chunks: usize,
    /// Unique paths looked up in the chunked phase.
    pub unique_paths: usize,
    /// Devices retried with a direct lookup after the chunked phase failed.
    pub fallback_devices: usize,
}

impl ResolveOutcome {
    pub fn hits(&self) -> usize {
        self.devices.iter().filter(|d| d.hit.is_some()).count()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &IdentityConflict> {
        self.devices.iter().flat_map(|d| d.conflicts.iter())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves priority-ordered identity keys to canonical records.
///
/// All working state is local to one `resolve` call; nothing is cached
/// across passes.
pub struct CanonicalResolver<S> {
    store: S,
    settings: ResolverSettings,
    span: tracing::Span,
}

impl<S: KvStore> CanonicalResolver<S> {
    pub fn new(store: S, settings: ResolverSettings) -> Self {
        let span = tracing::info_span!("canonical_resolver", namespace = %settings.namespace);
        Self::with_span(store, settings, span)
    }

    pub fn with_span(store: S, settings: ResolverSettings, span: tracing::Span) -> Self {
        Self {
            store,
            settings,
            span,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve every device's ordered keys.
    ///
    /// Store failures degrade to "no match" for the affected devices and are
    /// reported in [`ResolveOutcome::first_error`]. On cancellation, in-flight
    /// lookups are abandoned and already-received chunks are still used.
    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        devices: &[Vec<IdentityKey>],
    ) -> ResolveOutcome {
        self.resolve_inner(cancel, devices)
            .instrument(self.span.clone())
            .await
    }

    async fn resolve_inner(
        &self,
        cancel: &CancellationToken,
        devices: &[Vec<IdentityKey>],
    ) -> ResolveOutcome {
        let device_paths: Vec<Vec<String>> = devices
            .iter()
            .map(|keys| {
                keys.iter()
                    .map(|k| key_path(k, &self.settings.namespace))
                    .collect()
            })
            .collect();

        let mut seen = BTreeSet::new();
        let unique: Vec<String> = device_paths
            .iter()
            .flatten()
            .filter(|p| seen.insert(p.as_str()))
            .cloned()
            .collect();

        let merged = self.fetch_chunked(cancel, &unique).await;
        if let Some(err) = &merged.first_error {
            tracing::warn!(
                operation = "batch_get",
                failed_chunks = merged.failed_chunks,
                succeeded_chunks = merged.succeeded_chunks,
                unique_paths = unique.len(),
                error = %err,
                "canonical lookup degraded"
            );
        }

        let mut outcome = ResolveOutcome {
            devices: Vec::with_capacity(devices.len()),
            first_error: merged.first_error.clone().map(ResolveError::from),
            failed_chunks: merged.failed_chunks,
            unique_paths: unique.len(),
            fallback_devices: 0,
        };

        for (keys, paths) in devices.iter().zip(&device_paths) {
            let mut resolution = pick_canonical(keys, paths, |p| merged.index.get(p));

            if resolution.hit.is_none()
                && merged.all_failed()
                && !paths.is_empty()
                && !cancel.is_cancelled()
            {
                outcome.fallback_devices += 1;
                resolution = self.direct_lookup(cancel, keys, paths).await;
            }
            outcome.devices.push(resolution);
        }

        for c in outcome.conflicts() {
            tracing::warn!(
                winner_key = %c.winner_key,
                winner = %c.winner_device_id,
                other_key = %c.other_key,
                other = %c.other_device_id,
                "identity keys of one device resolve to different canonical devices"
            );
        }

        tracing::debug!(
            devices = devices.len(),
            unique_paths = outcome.unique_paths,
            hits = outcome.hits(),
            fallback_devices = outcome.fallback_devices,
            "canonical resolution pass complete"
        );
        outcome
    }

    async fn fetch_chunked(&self, cancel: &CancellationToken, paths: &[String]) -> MergedChunks {
        if paths.is_empty() {
            return MergedChunks::default();
        }

        let chunks = split_chunks(paths, self.settings.chunk_size);
        let store = &self.store;
        let lookups = chunks.into_iter().enumerate().map(|(index, chunk)| async move {
            let cancelled = ChunkResult {
                index,
                paths: chunk.clone(),
                outcome: Err(KvError::Cancelled),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => vec![cancelled],
                results = fetch_chunk(store, index, chunk) => results,
            }
        });

        let results: Vec<Vec<ChunkResult>> = futures_util::stream::iter(lookups)
            .buffer_unordered(self.settings.max_concurrent_chunks.max(1))
            .collect()
            .await;

        merge_chunks(results.into_iter().flatten().collect())
    }

    /// Single unchunked lookup of one device's paths.
    async fn direct_lookup(
        &self,
        cancel: &CancellationToken,
        keys: &[IdentityKey],
        paths: &[String],
    ) -> DeviceResolution {
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KvError::Cancelled),
            r = self.store.batch_get(paths) => r,
        };
        match answer {
            Ok(entries) => {
                let index: std::collections::BTreeMap<String, KvEntry> =
                    entries.into_iter().map(|e| (e.key.clone(), e)).collect();
                pick_canonical(keys, paths, |p| index.get(p))
            }
            Err(err) => {
                tracing::debug!(
                    operation = "batch_get",
                    paths = paths.len(),
                    error = %err,
                    "direct canonical lookup failed"
                );
                DeviceResolution::default()
            }
        }
    }
}

/// Walk `keys` in order; the first path that is found, non-empty and decodes
/// to a valid record wins. Later valid keys naming a different canonical
/// device are reported as conflicts.
pub fn pick_canonical<'a, F>(keys: &[IdentityKey], paths: &[String], lookup: F) -> DeviceResolution
where
    F: Fn(&str) -> Option<&'a KvEntry>,
{
    let mut out = DeviceResolution::default();

    for (key, path) in keys.iter().zip(paths) {
        let Some(entry) = lookup(path) else { continue };
        if !entry.found || entry.value.is_empty() {
            continue;
        }
        let record = match CanonicalRecord::decode(&entry.value) {
            Ok(r) => r,
            Err(err) => {
                tracing::debug!(path = %path, error = %err, "skipping undecodable canonical record");
                continue;
            }
        };

        match &out.hit {
            None => {
                out.hit = Some(Resolution {
                    record,
                    revision: entry.revision,
                    key: key.clone(),
                    path: path.clone(),
                });
            }
            Some(win) if win.record.canonical_device_id != record.canonical_device_id => {
                let already = out
                    .conflicts
                    .iter()
                    .any(|c| c.other_device_id == record.canonical_device_id);
                if !already {
                    out.conflicts.push(IdentityConflict {
                        winner_key: win.key.clone(),
                        winner_device_id: win.record.canonical_device_id.clone(),
                        other_key: key.clone(),
                        other_device_id: record.canonical_device_id,
                    });
                }
            }
            Some(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use idr_schemas::IdentityKind;

    fn entry(path: &str, id: &str, rev: u64) -> KvEntry {
        let rec = CanonicalRecord {
            canonical_device_id: id.to_string(),
            partition: "default".to_string(),
            metadata_hash: String::new(),
            updated_at: None,
            attributes: Default::default(),
        };
        KvEntry {
            key: path.to_string(),
            found: true,
            value: rec.encode().unwrap(),
            revision: rev,
        }
    }

    fn keys() -> (Vec<IdentityKey>, Vec<String>) {
        let keys = vec![
            IdentityKey::new(IdentityKind::Mac, "aa"),
            IdentityKey::new(IdentityKind::Hostname, "h"),
            IdentityKey::new(IdentityKind::Ip, "10.0.0.1"),
        ];
        let paths = keys.iter().map(|k| key_path(k, "ns")).collect();
        (keys, paths)
    }

    #[test]
    fn first_valid_key_wins_and_garbage_is_skipped() {
        let (keys, paths) = keys();
        let mut garbage = entry(&paths[0], "x", 1);
        garbage.value = b"{broken".to_vec();
        let index: std::collections::BTreeMap<String, KvEntry> = [
            (paths[0].clone(), garbage),
            (paths[1].clone(), entry(&paths[1], "sr:host", 7)),
            (paths[2].clone(), entry(&paths[2], "sr:host", 9)),
        ]
        .into_iter()
        .collect();

        let res = pick_canonical(&keys, &paths, |p| index.get(p));
        let hit = res.hit.unwrap();
        assert_eq!(hit.record.canonical_device_id, "sr:host");
        assert_eq!(hit.revision, 7);
        assert_eq!(hit.key.kind, IdentityKind::Hostname);
        assert!(res.conflicts.is_empty());
    }

    #[test]
    fn disagreeing_lower_key_is_reported_not_used() {
        let (keys, paths) = keys();
        let index: std::collections::BTreeMap<String, KvEntry> = [
            (paths[0].clone(), entry(&paths[0], "sr:mac", 1)),
            (paths[2].clone(), entry(&paths[2], "sr:ip", 2)),
        ]
        .into_iter()
        .collect();

        let res = pick_canonical(&keys, &paths, |p| index.get(p));
        assert_eq!(res.hit.unwrap().record.canonical_device_id, "sr:mac");
        assert_eq!(res.conflicts.len(), 1);
        assert_eq!(res.conflicts[0].other_device_id, "sr:ip");
        assert_eq!(res.conflicts[0].other_key.kind, IdentityKind::Ip);
    }

    #[test]
    fn missing_and_empty_entries_mean_no_match() {
        let (keys, paths) = keys();
        let mut empty = entry(&paths[1], "sr:x", 1);
        empty.value.clear();
        let index: std::collections::BTreeMap<String, KvEntry> = [
            (paths[0].clone(), KvEntry::missing(paths[0].clone())),
            (paths[1].clone(), empty),
        ]
        .into_iter()
        .collect();

        let res = pick_canonical(&keys, &paths, |p| index.get(p));
        assert!(res.hit.is_none());
    }
}
