//! Shipway Pipeline - run execution and branch orchestration
//!
//! Drives commits through the build/test/deploy pipeline:
//! - Executes command stages with timeouts and retry budgets
//! - Records every attempt in the run ledger
//! - Schedules runs per tracked branch, serialized per instance

pub mod driver;
pub mod executor;
pub mod orchestrator;
pub mod stage;

// Re-export key types
pub use driver::{RunConfig, RunDriver};
pub use executor::{CommandStageExecutor, StageExecutor, StageOutput};
pub use orchestrator::{Orchestrator, TrackedBranch};
pub use stage::Stage;
