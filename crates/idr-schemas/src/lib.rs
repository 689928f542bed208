//! idr-schemas
//!
//! Shared data model for identity reconciliation: identity keys, canonical
//! records, device updates, sightings, subnet policies and audit rows.
//!
//! No IO here. Encoding helpers only cover the canonical record payload that
//! lives in the key-value store.

mod audit;
mod device;
mod identity;
pub mod meta;
mod sighting;

pub use audit::{MergeAuditEvent, SightingEvent, SightingEventType};
pub use device::{sources, DeviceState, DeviceUpdate, RawObservation};
pub use identity::{CanonicalRecord, IdentityKey, IdentityKind, RecordCodecError};
pub use sighting::{Promotion, PromotionRules, Sighting, SightingStatus, SubnetPolicy};

use std::collections::BTreeMap;

/// String-to-string metadata carried on updates, sightings and audit rows.
///
/// Keys in common use are listed in [`meta`]; anything else is passed through
/// untouched.
pub type Metadata = BTreeMap<String, String>;
