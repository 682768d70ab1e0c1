//! Periodic scaler: reads queue depth and the live-worker census, then
//! launches workers under the policy caps. Scale-down never happens here;
//! workers exit themselves when the queue goes idle.

pub mod policy;
pub mod tick;

pub use policy::ScalePolicy;
pub use tick::{DispatchOutcome, Dispatcher};
