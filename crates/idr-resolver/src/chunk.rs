use std::collections::BTreeMap;

use idr_kv::{KvEntry, KvError, KvStore};

/// Keys per `batch_get` call.
pub const DEFAULT_CHUNK_SIZE: usize = 256;
/// Chunks in flight at once.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 8;

/// Outcome of one `batch_get` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    /// Position of the originating chunk in dispatch order. Halves produced
    /// by splitting keep their parent's index.
    pub index: usize,
    pub paths: Vec<String>,
    pub outcome: Result<Vec<KvEntry>, KvError>,
}

/// Reduction of every [`ChunkResult`] of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedChunks {
    /// path -> entry, for every path any successful call answered.
    pub index: BTreeMap<String, KvEntry>,
    /// Error of the lowest-indexed failed call.
    pub first_error: Option<KvError>,
    pub failed_chunks: usize,
    pub succeeded_chunks: usize,
}

impl MergedChunks {
    /// At least one call was made and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        self.failed_chunks > 0 && self.succeeded_chunks == 0
    }
}

/// Split `paths` into consecutive chunks of at most `chunk_size` (min 1).
pub fn split_chunks(paths: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    paths
        .chunks(chunk_size.max(1))
        .map(<[String]>::to_vec)
        .collect()
}

/// Fold chunk results into one path index. Order of arrival does not
/// matter: results are reduced in `index` order so `first_error` is stable.
pub fn merge_chunks(mut results: Vec<ChunkResult>) -> MergedChunks {
    results.sort_by_key(|r| r.index);

    let mut merged = MergedChunks::default();
    for r in results {
        match r.outcome {
            Ok(entries) => {
                merged.succeeded_chunks += 1;
                for e in entries {
                    merged.index.insert(e.key.clone(), e);
                }
            }
            Err(err) => {
                merged.failed_chunks += 1;
                if merged.first_error.is_none() {
                    merged.first_error = Some(err);
                }
            }
        }
    }
    merged
}

/// One chunk lookup. A `ResourceExhausted` answer splits the chunk in half
/// and retries each half; single-key chunks are never split.
pub(crate) async fn fetch_chunk<S: KvStore + ?Sized>(
    store: &S,
    index: usize,
    paths: Vec<String>,
) -> Vec<ChunkResult> {
    let mut pending = vec![paths];
    let mut out = Vec::new();

    while let Some(mut paths) = pending.pop() {
        match store.batch_get(&paths).await {
            Err(KvError::ResourceExhausted { requested }) if paths.len() > 1 => {
                tracing::debug!(
                    operation = "batch_get",
                    requested,
                    "chunk too large, splitting"
                );
                let right = paths.split_off(paths.len() / 2);
                pending.push(right);
                pending.push(paths);
            }
            outcome => out.push(ChunkResult {
                index,
                paths,
                outcome,
            }),
        }
    }
    out
}
