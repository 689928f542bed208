mod engine;
mod policy;

pub use engine::{
    evaluate, evaluate_batch, DriftGuard, DriftStatus, PromotionRun, PromotionRunSummary,
    PromotionSettings, BLOCKER_DISABLED, BLOCKER_DRIFT, BLOCKER_SIGHTINGS_ONLY,
};
pub use policy::{select_policy, Cidr, CidrParseError};
