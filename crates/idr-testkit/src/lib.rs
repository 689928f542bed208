//! idr-testkit
//!
//! In-process doubles for the identity engine's external collaborators,
//! observation builders, and the cross-crate scenario tests under `tests/`.
//!
//! Nothing here talks to a network. Every double is deterministic apart from
//! failures a test injects on purpose.

mod builders;
mod doubles;
mod flaky_kv;

pub use builders::{device_state, subnet_policy, ObservationBuilder};
pub use doubles::{RecordingSubmitter, StaticConnector, StaticDeviceStates};
pub use flaky_kv::FlakyKvStore;

use tracing_subscriber::EnvFilter;

/// Install a test-writer `fmt` subscriber once per process. `RUST_LOG`
/// overrides the default `warn` filter.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
