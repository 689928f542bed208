use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SightingEventType {
    Promoted,
    Dismissed,
    Expired,
}

impl SightingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SightingEventType::Promoted => "promoted",
            SightingEventType::Dismissed => "dismissed",
            SightingEventType::Expired => "expired",
        }
    }
}

/// One terminal transition of a sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SightingEvent {
    pub event_id: Uuid,
    pub sighting_id: String,
    pub partition: String,
    /// Canonical device the sighting became, for `promoted` rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub event_type: SightingEventType,
    pub actor: String,
    #[serde(default)]
    pub details: Metadata,
    pub created_at: DateTime<Utc>,
}

/// One canonical merge: `from_device_id` was folded into `to_device_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeAuditEvent {
    pub event_id: Uuid,
    pub from_device_id: String,
    pub to_device_id: String,
    pub partition: String,
    pub reason: String,
    pub source: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub details: Metadata,
    pub created_at: DateTime<Utc>,
}
