//! # propgen core
//!
//! Pipeline orchestration and real-time coordination for the proposal
//! generator: a durable SQLite-backed job queue, one worker pool per
//! pipeline stage, and the session-multiplexed progress/question channel
//! that lets a running stage pause for human input.

pub mod channel;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod project;
pub mod status;
pub mod types;

pub use config::PipelineConfig;
pub use db::PipelineDb;
pub use error::StageError;
