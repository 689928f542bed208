use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::diff::{generate_retractions, SourceIdentity};
use crate::{DeviceStateQuery, ReconcileError, ReconcileState, ResultSubmitter, SourceConnector};

/// Per-source reconcile configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSettings {
    pub identity: SourceIdentity,
    /// Retract everything when a fetch legitimately returns zero devices.
    pub allow_empty_snapshot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub source: String,
    pub fetched: usize,
    pub prior_states: usize,
    pub retracted: usize,
    pub skipped_malformed: usize,
    /// Retractions withheld because the snapshot was empty.
    pub suppressed_empty_snapshot: bool,
}

/// Runs reconcile passes for one source.
pub struct Reconciler {
    settings: SourceSettings,
    connector: Arc<dyn SourceConnector>,
    states: Arc<dyn DeviceStateQuery>,
    submitter: Arc<dyn ResultSubmitter>,
    state: Mutex<ReconcileState>,
    span: tracing::Span,
}

/// Returns the reconciler to `Idle` however the pass ends.
struct PassGuard<'a> {
    state: &'a Mutex<ReconcileState>,
}

impl PassGuard<'_> {
    fn enter(&self, next: ReconcileState) {
        *lock(self.state) = next;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = ReconcileState::Idle;
    }
}

fn lock(state: &Mutex<ReconcileState>) -> MutexGuard<'_, ReconcileState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

impl Reconciler {
    pub fn new(
        settings: SourceSettings,
        connector: Arc<dyn SourceConnector>,
        states: Arc<dyn DeviceStateQuery>,
        submitter: Arc<dyn ResultSubmitter>,
    ) -> Self {
        let span = tracing::info_span!("reconciler", source = %settings.identity.source);
        Self {
            settings,
            connector,
            states,
            submitter,
            state: Mutex::new(ReconcileState::Idle),
            span,
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub fn state(&self) -> ReconcileState {
        *lock(&self.state)
    }

    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<ReconcileReport, ReconcileError> {
        self.run_pass_at(cancel, Utc::now()).await
    }

    /// One full pass stamped with `now`.
    pub async fn run_pass_at(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let guard = {
            let mut current = lock(&self.state);
            if *current != ReconcileState::Idle {
                return Err(ReconcileError::Busy { state: *current });
            }
            *current = ReconcileState::Fetching;
            PassGuard { state: &self.state }
        };

        let result = self.pass(&guard, cancel, now).instrument(self.span.clone()).await;
        if let Err(e) = &result {
            self.span.in_scope(|| {
                tracing::error!(
                    source = %self.settings.identity.source,
                    operation = "reconcile_pass",
                    error = %e,
                    "reconcile pass failed"
                );
            });
        }
        result
    }

    async fn pass(
        &self,
        guard: &PassGuard<'_>,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let source = self.settings.identity.source.clone();

        // Fetching: the whole snapshot, pagination included.
        let current = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ReconcileError::Cancelled { stage: ReconcileState::Fetching });
            }
            r = self.connector.fetch() => r.map_err(|error| ReconcileError::Fetch {
                source: source.clone(),
                error,
            })?,
        };

        guard.enter(ReconcileState::Diffing);
        let prior = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ReconcileError::Cancelled { stage: ReconcileState::Diffing });
            }
            r = self.states.get_device_states_by_source(&source) => {
                r.map_err(|error| ReconcileError::StateQuery { source: source.clone(), error })?
            }
        };

        let mut report = ReconcileReport {
            source: source.clone(),
            fetched: current.len(),
            prior_states: prior.len(),
            ..ReconcileReport::default()
        };

        if current.is_empty() && !prior.is_empty() && !self.settings.allow_empty_snapshot {
            tracing::warn!(
                source = %source,
                operation = "reconcile_pass",
                prior_states = prior.len(),
                "empty snapshot; retractions suppressed"
            );
            report.suppressed_empty_snapshot = true;
            return Ok(report);
        }

        let diff = generate_retractions(&current, &prior, &self.settings.identity, now);
        report.skipped_malformed = diff.skipped_malformed.len();

        if diff.retractions.is_empty() {
            tracing::info!(
                source = %source,
                fetched = report.fetched,
                prior_states = report.prior_states,
                skipped_malformed = report.skipped_malformed,
                "reconcile pass complete; nothing to retract"
            );
            return Ok(report);
        }

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled { stage: ReconcileState::Diffing });
        }

        // Submitting: once started, the submit call runs to completion.
        guard.enter(ReconcileState::Submitting);
        let count = diff.retractions.len();
        self.submitter
            .submit_batch_sweep_results(&diff.retractions)
            .await
            .map_err(|error| ReconcileError::Submit {
                source: source.clone(),
                retractions: count,
                error,
            })?;

        report.retracted = count;
        tracing::info!(
            source = %source,
            fetched = report.fetched,
            prior_states = report.prior_states,
            retracted = report.retracted,
            skipped_malformed = report.skipped_malformed,
            "reconcile pass complete"
        );
        Ok(report)
    }
}
