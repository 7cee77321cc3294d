//! Pipeline orchestration for Gantry: matrix expansion, stage execution,
//! coverage aggregation and supersede-on-trigger cancellation.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod coverage;
pub mod dag;
pub mod errors;
pub mod instance;
pub mod matrix;
pub mod orchestrator;
pub mod process;
pub mod result;
pub mod stages;
pub mod template;

// Re-export public API for convenience
pub use cancel::{CancellationController, RunTicket};
pub use errors::StageError;
pub use orchestrator::{check_pipeline, create_state_backend, plan, CheckResult, Orchestrator, RunPlan};
pub use result::{InstanceOutcome, RunOutcome, StageResult, StageState};
