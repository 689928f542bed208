//! idr-resolver
//!
//! Canonical identity resolution against the shared key-value store.
//!
//! - [`CanonicalResolver`]: batched, chunked lookup of priority-ordered keys
//!   with graceful degradation and conflict detection
//! - [`attach_canonical_metadata`]: enrich an update with its canonical record
//! - [`CanonicalPublisher`]: optimistic-concurrency writer for canonical records
//!
//! Store failures never abort the caller's pipeline: they degrade to "no
//! enrichment" and are reported next to the partial result.

mod attach;
mod chunk;
mod publisher;
mod resolver;

pub use attach::{attach_canonical_metadata, tag_conflicts};
pub use chunk::{
    merge_chunks, split_chunks, ChunkResult, MergedChunks, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_CONCURRENT_CHUNKS,
};
pub use publisher::{
    skip_publish, CanonicalPublisher, KeyWrite, PublishError, PublishReport, PublisherSettings,
};
pub use resolver::{
    pick_canonical, CanonicalResolver, DeviceResolution, IdentityConflict, Resolution,
    ResolveError, ResolveOutcome, ResolverSettings,
};
