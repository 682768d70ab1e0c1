//! Worker module split across focused submodules:
//! - `types`: worker states, outcomes, and the run summary
//! - `lease`: the background visibility keeper
//! - `process`: worker struct plus the poll/process/drain loop

pub mod lease;
pub mod process;
pub mod types;

pub use process::{Worker, WorkerParams};
pub use types::{WorkerState, WorkerSummary};
