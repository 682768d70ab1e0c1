//! Copy and delete engines plus the retry/backoff and part-planning
//! primitives they share.

pub mod backoff;
pub mod copier;
pub mod deleter;
pub mod plan;

pub use copier::{CopyEngine, CopyOutcome};
pub use deleter::{DeleteEngine, DeleteOutcome};
pub use plan::CopyPlan;
