//! Shipway Core Library
//!
//! Domain engine for the CI/CD orchestrator: the Revision Store (commit
//! DAG and branch pointers), the Instance Manager, the engine event bus,
//! the error taxonomy, configuration, and observability plumbing.

pub mod config;
pub mod error;
pub mod events;
pub mod instance;
pub mod metrics;
pub mod revision;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use instance::{Deployer, InstanceManager, NoopDeployer};
pub use metrics::METRICS;
pub use revision::{CommitMeta, HistoryWalk, RevisionStore, UpdateMode};
pub use telemetry::init_tracing;

pub use shipway_state::{CommitId, SurrealStore};

/// Shipway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
