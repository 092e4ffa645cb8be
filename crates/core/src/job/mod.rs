//! Durable job queue: the persisted job record and the store that hands
//! leases to stage workers.

pub mod store;
pub mod types;

pub use store::JobStore;
pub use types::{CancelOutcome, Job, JobState};
