//! Shipway-State: SurrealDB Backend for Shipway
//!
//! This crate provides the persistence layer for the CI/CD orchestration
//! engine. It handles all I/O with SurrealDB, giving the upper layers a
//! clean storage abstraction for the commit DAG, pipeline runs, and
//! deployable instances.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: Data integrity, append-only histories, and graph traversal.
//!
//! ## Key Components
//!
//! - `SurrealStore`: Manages the connection and implements all storage traits
//! - `CommitGraph`: Commit DAG nodes and branch pointers
//! - `RunLedger`: Pipeline run persistence with guarded status transitions
//! - `InstanceRegistry`: Deployable instances and their deployment history

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
mod surreal_ledger;
mod surreal_registry;

pub use error::{StateError, StorageError};
pub use handle::SurrealStore;
pub use migrations::init_schema;
pub use schema::{
    BranchRecord, CommitId, CommitRecord, DeploymentRecord, InstanceRecord, RunRecord,
    StageResultRecord,
};
pub use storage_traits::{
    Branch, Commit, CommitGraph, DeploymentEntry, DeploymentKind, HealthStatus, Instance,
    InstanceRegistry, PipelineRun, RunId, RunLedger, RunStatus, StageOutcome, StageResult,
    StorageResult,
};

/// Result type for shipway-state operations
pub type Result<T> = std::result::Result<T, StateError>;
