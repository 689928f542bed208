//! idr-audit
//!
//! Append-only audit history for sighting transitions and canonical merges.
//!
//! Every promotion, dismissal, expiry and merge produces exactly one row.
//! Rows are never updated or deleted. When backed by a file, rows are JSON
//! Lines with an optional SHA-256 hash chain ([`verify_hash_chain`]).

mod chain;
mod log;

pub use chain::{compute_line_hash, verify_hash_chain, verify_hash_chain_str, AuditLine, VerifyResult};
pub use log::AuditLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use idr_schemas::{MergeAuditEvent, SightingEvent};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    Sighting(SightingEvent),
    Merge(MergeAuditEvent),
}

impl AuditRecord {
    pub fn actor(&self) -> &str {
        match self {
            AuditRecord::Sighting(e) => &e.actor,
            AuditRecord::Merge(e) => &e.actor,
        }
    }

    pub fn partition(&self) -> &str {
        match self {
            AuditRecord::Sighting(e) => &e.partition,
            AuditRecord::Merge(e) => &e.partition,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::Sighting(e) => e.created_at,
            AuditRecord::Merge(e) => e.created_at,
        }
    }

    /// Sighting this row is about. Merge rows carry it in `details` when the
    /// merge came from a promotion.
    pub fn sighting_id(&self) -> Option<&str> {
        match self {
            AuditRecord::Sighting(e) => Some(&e.sighting_id),
            AuditRecord::Merge(e) => idr_schemas::meta::value(&e.details, idr_schemas::meta::SIGHTING_ID),
        }
    }

    pub fn mentions_device(&self, device_id: &str) -> bool {
        match self {
            AuditRecord::Sighting(e) => e.device_id.as_deref() == Some(device_id),
            AuditRecord::Merge(e) => e.from_device_id == device_id || e.to_device_id == device_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Filters combine with AND. `actor` and `partition` are case-insensitive
/// substring matches; ids match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub sighting_id: Option<String>,
    pub device_id: Option<String>,
    pub actor: Option<String>,
    pub partition: Option<String>,
    /// 0 means [`DEFAULT_QUERY_LIMIT`].
    pub limit: usize,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(id) = &self.sighting_id {
            if record.sighting_id() != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(dev) = &self.device_id {
            if !record.mentions_device(dev) {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if !contains_ci(record.actor(), actor) {
                return false;
            }
        }
        if let Some(part) = &self.partition {
            if !contains_ci(record.partition(), part) {
                return false;
            }
        }
        true
    }

    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            self.limit
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.trim().to_lowercase())
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Where sighting and merge audit rows go. Append-only: there is no update
/// or delete.
pub trait AuditSink: Send + Sync {
    fn append_sighting_event(&self, event: SightingEvent) -> anyhow::Result<()>;

    fn append_merge_event(&self, event: MergeAuditEvent) -> anyhow::Result<()>;

    /// Matching rows, newest first.
    fn query(&self, query: &AuditQuery) -> Vec<AuditRecord>;
}
