//! Orchestration core: persistent record store, retry policy, safety
//! governor, stage handlers, and the tick scheduler that drives them.

pub mod retry;
pub mod safety;
pub mod scheduler;
pub mod stages;
pub mod store;

pub use retry::{RetryPolicy, StageError};
pub use safety::{Governor, SafetyLimits, Verdict};
pub use scheduler::{Collaborators, Scheduler, TickReport};
pub use stages::{StageHandler, StageOutcome};
pub use store::{CasResult, ClaimOutcome, RecordStore, StoreError, UpsertOutcome};
