//! idr-config
//!
//! Layered YAML configuration for the identity engine.
//!
//! Documents are deep-merged in order (later overrides earlier), checked for
//! literal secrets, canonicalised to JSON and hashed. [`IdentityConfig`] is
//! the typed view the runtime consumes.

mod identity;
mod layering;
mod unused;

pub use identity::{
    DriftSection, FingerprintingSection, IdentityConfig, NodeDefaults, PromotionSection,
    ReaperSection, ReconciliationSection, ResolvedSource, ResolverSection, SourceSection,
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_PARTITION, DEFAULT_TTL_SECS,
    MAX_TTL_SECS,
};
pub use layering::{load_layered_yaml, load_layered_yaml_from_strings, LoadedConfig};
pub use unused::{consumed_pointers, report_unused_keys, UnusedKeyPolicy, UnusedKeyReport};
