//! idr-runtime
//!
//! Wires the identity components into the passes a discovery service runs:
//!
//! - [`IdentityEngine::process_batch`]: keys, resolution, enrichment, sightings
//! - [`IdentityEngine::process_discovery`]: the above plus the derived sweep
//!   config write for the source
//! - [`IdentityEngine::promote_sighting`] / [`IdentityEngine::dismiss_sighting`]
//! - [`IdentityEngine::reconcile_sightings`]: TTL sweep, drift check,
//!   auto-promotion
//!
//! Settings come from [`idr_config::IdentityConfig`] via [`EngineSettings`].

mod engine;
mod settings;
mod sweep_config;

pub use engine::{
    BatchOutcome, DiscoveryReport, EngineError, IdentityEngine, SightingPassReport,
    MERGE_REASON_IDENTITY_CONFLICT, SYSTEM_ACTOR,
};
pub use settings::{reconciler_settings, EngineSettings};
pub use sweep_config::{
    sweep_config_path, ConfigWriteError, SweepConfigWriter, SweepTargets, SweepWrite,
};
