//! idr-reconcile
//!
//! Diff-based retraction of devices that disappeared from a source.
//!
//! A pass is `Idle -> Fetching -> Diffing -> Submitting -> Idle`. Fetch,
//! diff and submit run strictly in sequence and any stage error aborts the
//! pass before anything is submitted. Prior states without a usable
//! `integration_id` are never retracted.

mod diff;
mod reconciler;

pub use diff::{generate_retractions, retraction_for, RetractionDiff, SourceIdentity};
pub use reconciler::{Reconciler, ReconcileReport, SourceSettings};

use std::fmt;

use async_trait::async_trait;

use idr_schemas::{DeviceState, DeviceUpdate, RawObservation};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Discovery source. Pagination is internal: `fetch` returns only once the
/// whole snapshot has been read.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> anyhow::Result<Vec<RawObservation>>;
}

/// Last known device states, per source.
#[async_trait]
pub trait DeviceStateQuery: Send + Sync {
    async fn get_device_states_by_source(&self, source: &str) -> anyhow::Result<Vec<DeviceState>>;
}

/// Downstream result transport. Delivery is at-least-once.
#[async_trait]
pub trait ResultSubmitter: Send + Sync {
    async fn submit_batch_sweep_results(&self, events: &[DeviceUpdate]) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// State / errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileState {
    Idle,
    Fetching,
    Diffing,
    Submitting,
}

impl ReconcileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileState::Idle => "idle",
            ReconcileState::Fetching => "fetching",
            ReconcileState::Diffing => "diffing",
            ReconcileState::Submitting => "submitting",
        }
    }
}

/// Why a pass failed. A failed pass submitted nothing, or its submit call
/// returned an error; either way the caller retries the whole pass.
#[derive(Debug)]
pub enum ReconcileError {
    /// Another pass on the same reconciler has not finished.
    Busy { state: ReconcileState },
    Fetch { source: String, error: anyhow::Error },
    StateQuery { source: String, error: anyhow::Error },
    Submit {
        source: String,
        retractions: usize,
        error: anyhow::Error,
    },
    Cancelled { stage: ReconcileState },
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Busy { state } => {
                write!(f, "reconcile pass already running (state={})", state.as_str())
            }
            ReconcileError::Fetch { source, error } => {
                write!(f, "fetch failed for source {source}: {error:#}")
            }
            ReconcileError::StateQuery { source, error } => {
                write!(f, "device-state query failed for source {source}: {error:#}")
            }
            ReconcileError::Submit {
                source,
                retractions,
                error,
            } => write!(
                f,
                "submitting {retractions} retractions for source {source} failed: {error:#}"
            ),
            ReconcileError::Cancelled { stage } => {
                write!(f, "reconcile pass cancelled while {}", stage.as_str())
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Fetch { error, .. }
            | ReconcileError::StateQuery { error, .. }
            | ReconcileError::Submit { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }
}
