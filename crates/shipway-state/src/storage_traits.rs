//! Storage trait definitions for Shipway
//!
//! These traits define the core storage abstractions:
//! - `CommitGraph`: Commit DAG nodes and branch pointers
//! - `RunLedger`: Pipeline run persistence with guarded status transitions
//! - `InstanceRegistry`: Deployable instances and append-only deployment history
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::schema::CommitId;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CommitGraph — Commit DAG and Branch Pointers
// ---------------------------------------------------------------------------

/// An immutable commit in the revision DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Content-hash identifier
    pub id: CommitId,
    /// Parent commit ids, in order (empty for roots, two for merges)
    pub parents: Vec<CommitId>,
    /// Author that created the commit
    pub author: String,
    /// Commit message
    pub message: String,
    /// Timestamp assigned by the revision store, strictly greater than
    /// every parent's timestamp
    pub timestamp: DateTime<Utc>,
}

/// A named, mutable pointer to a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name, unique within the store
    pub name: String,
    /// Current head commit id
    pub head: CommitId,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Commit DAG and branch pointer store.
///
/// Guarantees:
/// - Commits are immutable once stored; `put_commit` with an existing id
///   returns the stored commit unchanged (content-addressed idempotency).
/// - A branch head always refers to a commit that exists in the store.
/// - Branch names are unique.
#[async_trait]
pub trait CommitGraph: Send + Sync {
    /// Store a commit. Idempotent: re-putting an existing id returns the
    /// already-stored commit.
    async fn put_commit(&self, commit: &Commit) -> StorageResult<Commit>;

    /// Retrieve a commit by id, if present.
    async fn get_commit(&self, id: &CommitId) -> StorageResult<Option<Commit>>;

    /// Check whether a commit exists.
    async fn contains_commit(&self, id: &CommitId) -> StorageResult<bool>;

    /// The greatest commit timestamp in the store, if any commits exist.
    /// Used to re-seed the monotonic timestamp issuer on restart.
    async fn latest_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>>;

    /// Create a branch. Fails with `BranchExists` if the name is taken.
    async fn create_branch(&self, name: &str, head: &CommitId) -> StorageResult<Branch>;

    /// Move an existing branch pointer. Fails with `BranchNotFound` if absent.
    /// Descendant checks are the caller's responsibility.
    async fn set_branch_head(&self, name: &str, head: &CommitId) -> StorageResult<Branch>;

    /// Retrieve a branch by name, if present.
    async fn get_branch(&self, name: &str) -> StorageResult<Option<Branch>>;

    /// List all branches, ordered by name.
    async fn list_branches(&self) -> StorageResult<Vec<Branch>>;

    /// Delete a branch. Fails with `BranchNotFound` if absent.
    async fn delete_branch(&self, name: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// RunLedger — Pipeline Run Persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    /// Whether the run can no longer transition (RolledBack reachable
    /// only from Failed, which is otherwise terminal).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::RolledBack
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single stage within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    TimedOut,
    /// Compensating deployment recorded during rollback
    RolledBack,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed => "failed",
            StageOutcome::TimedOut => "timed_out",
            StageOutcome::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// A single stage result in a run's ordered sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Monotonic sequence number within the run (1-indexed)
    pub seq: u64,
    /// Stage name ("build", "test", "deploy")
    pub stage: String,
    /// Stage outcome
    pub outcome: StageOutcome,
    /// Process exit code, when the stage ran a command
    pub exit_code: Option<i32>,
    /// Captured output or error detail
    pub detail: String,
    /// Stage duration in milliseconds
    pub duration_ms: u64,
}

/// Full pipeline run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub commit_id: CommitId,
    pub branch: String,
    /// 1-based attempt number; retries get a new run with attempt + 1
    pub attempt: u32,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - Stage results are ordered by monotonic `seq` within a run and are
///   append-only: once recorded, never removed or reordered.
/// - A run transitions: Pending → Running → Succeeded | Failed, and
///   Failed → RolledBack. Terminal runs are immutable (except the single
///   Failed → RolledBack step, which appends exactly one compensating
///   stage result).
/// - Appending a stage result to a non-Running run fails with
///   `InvalidRunState`, making each stage transition atomic relative to
///   run-state reads.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run in `Pending` state, returning its unique ID.
    async fn create_run(
        &self,
        commit_id: &CommitId,
        branch: &str,
        attempt: u32,
    ) -> StorageResult<RunId>;

    /// Transition a run Pending → Running.
    async fn start_run(&self, run_id: &RunId) -> StorageResult<()>;

    /// Record the stage currently executing. Requires `Running`.
    async fn set_current_stage(&self, run_id: &RunId, stage: &str) -> StorageResult<()>;

    /// Append a stage result to a running run. Fails if not `Running`.
    async fn append_stage_result(&self, run_id: &RunId, result: StageResult) -> StorageResult<()>;

    /// Transition a run Running → Succeeded.
    async fn complete_run(&self, run_id: &RunId) -> StorageResult<()>;

    /// Transition a run Running → Failed with an optional reason.
    async fn fail_run(&self, run_id: &RunId, reason: Option<String>) -> StorageResult<()>;

    /// Transition a run Failed → RolledBack, appending the compensating
    /// deployment stage result in the same step.
    async fn roll_back_run(&self, run_id: &RunId, compensation: StageResult) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRun>;

    /// Retrieve all stage results for a run, ordered by seq.
    async fn get_stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResult>>;

    /// List runs, optionally filtered by branch, newest first.
    async fn list_runs(&self, branch: Option<&str>) -> StorageResult<Vec<PipelineRun>>;
}

// ---------------------------------------------------------------------------
// InstanceRegistry — Deployable Instances
// ---------------------------------------------------------------------------

/// Health status of a deployable instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// Kind of deployment history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

/// A deployable project instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub project_id: String,
    /// Currently deployed commit (None until first successful deploy)
    pub deployed: Option<CommitId>,
    /// Desired commit (set at the start of each deployment)
    pub desired: Option<CommitId>,
    pub health: HealthStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in an instance's append-only deployment history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEntry {
    /// Monotonic sequence number within the instance (1-indexed)
    pub seq: u64,
    /// Commit deployed (or rolled back to)
    pub commit_id: CommitId,
    pub kind: DeploymentKind,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Registry of deployable instances.
///
/// Semantics:
/// - Instance rows are mutated only through these methods (upper layers
///   never rewrite them directly).
/// - Deployment history is append-only: rollback appends a new `Rollback`
///   entry rather than rewriting earlier entries, preserving the full
///   audit trail.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Register a new instance for a project, returning it with a fresh id.
    async fn register(&self, project_id: &str) -> StorageResult<Instance>;

    /// Retrieve an instance. Fails with `InstanceNotFound` if absent.
    async fn get(&self, instance_id: &str) -> StorageResult<Instance>;

    /// List all instances.
    async fn list(&self) -> StorageResult<Vec<Instance>>;

    /// Set the desired commit for an instance.
    async fn set_desired(&self, instance_id: &str, commit_id: &CommitId) -> StorageResult<()>;

    /// Mark a deployment successful: deployed = commit, health = Healthy.
    async fn mark_deployed(&self, instance_id: &str, commit_id: &CommitId) -> StorageResult<()>;

    /// Mark an instance unhealthy after a failed deployment; `deployed`
    /// is left unchanged.
    async fn mark_unhealthy(&self, instance_id: &str) -> StorageResult<()>;

    /// Append a deployment history entry.
    async fn append_deployment(
        &self,
        instance_id: &str,
        entry: DeploymentEntry,
    ) -> StorageResult<()>;

    /// Retrieve the full deployment history for an instance, ordered by seq.
    async fn deployments(&self, instance_id: &str) -> StorageResult<Vec<DeploymentEntry>>;
}
