//! Domain-level error taxonomy for Shipway.

use shipway_state::{RunId, StorageError};

/// Shipway engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid parent commit: {0}")]
    InvalidParent(String),

    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    #[error("non-fast-forward update of branch {branch}: {new_head} does not descend from {old_head}")]
    NonFastForward {
        branch: String,
        old_head: String,
        new_head: String,
    },

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("deployment already in flight for instance {0}")]
    AlreadyDeploying(String),

    #[error("no prior successful deployment for instance {0}")]
    NoPriorDeployment(String),

    #[error("deployment failed for instance {instance_id}: {reason}")]
    DeploymentFailed { instance_id: String, reason: String },

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("run {run_id} never attempted a deploy; nothing to roll back")]
    NothingToRollBack { run_id: RunId },

    #[error("stage {stage} timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("stage {stage} failed: {detail}")]
    StageFailed { stage: String, detail: String },

    #[error("run {run_id} cancelled by user")]
    CancelledByUser { run_id: RunId },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("orchestrator stopped; no longer accepting submissions")]
    OrchestratorStopped,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the pipeline retry policy applies to this error.
    ///
    /// Timeouts and stage/deploy failures are transient and retried up to
    /// the configured bound; everything else surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StageTimeout { .. }
                | EngineError::StageFailed { .. }
                | EngineError::DeploymentFailed { .. }
        )
    }
}

/// Result type for Shipway engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
