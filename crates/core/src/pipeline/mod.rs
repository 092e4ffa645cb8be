//! Pipeline orchestration: the fixed stage chain, the stage-author
//! context, the per-queue worker pools and the stage handlers.

pub mod context;
pub mod handlers;
pub mod stage;
pub mod worker;

pub use context::StageContext;
pub use handlers::{validate_intake, StageHandlers, StageOutcome};
pub use stage::{ProjectStatus, Stage};
pub use worker::PipelineRuntime;
