//! Error types for shipway-state

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Transaction failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the storage traits (`CommitGraph`, `RunLedger`,
/// `InstanceRegistry`), independent of which backend produced them.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-level failure (connection, query, serialization)
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Commit not found
    #[error("Commit not found: {commit_id}")]
    CommitNotFound { commit_id: String },

    /// Branch not found
    #[error("Branch not found: {name}")]
    BranchNotFound { name: String },

    /// Branch already exists
    #[error("Branch already exists: {name}")]
    BranchExists { name: String },

    /// Pipeline run not found
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Instance not found
    #[error("Instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    /// Instance already registered
    #[error("Instance already registered: {instance_id}")]
    InstanceExists { instance_id: String },

    /// Run is not in the state required for the requested transition
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Malformed commit id (must be 64 lowercase hex chars)
    #[error("Invalid commit id: {commit_id}")]
    InvalidCommitId { commit_id: String },

    /// No prior successful deployment to roll back to
    #[error("No prior deployment for instance: {instance_id}")]
    NoPriorDeployment { instance_id: String },
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
