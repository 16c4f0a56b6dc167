//! Schema definitions for Shipway SurrealDB tables
//!
//! Tables:
//! - commits: Immutable commit DAG nodes
//! - branches: Branch pointers to commit IDs
//! - runs: Pipeline run metadata and status
//! - stage_results: Ordered stage results within a run
//! - instances: Deployable project instances
//! - deployments: Append-only deployment history per instance

use chrono::{DateTime, Utc};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Commit ID - SHA-256 content hash over the commit's identity fields.
///
/// The inner field is private to guarantee the string is always valid
/// 64-char lowercase hex produced by `compute` or validated via
/// `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// Compute a commit ID from its identity fields.
    ///
    /// The hash is domain-separated: parent ids (in order), author, and
    /// message each get a marker and a NUL terminator so that shifting
    /// bytes between fields can never collide.
    pub fn compute(parents: &[CommitId], author: &str, message: &str) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(b"P");
        hasher.update((parents.len() as u64).to_be_bytes());
        for parent in parents {
            hasher.update(parent.0.as_bytes());
            hasher.update(b"\0");
        }

        hasher.update(b"A:");
        hasher.update(author.as_bytes());
        hasher.update(b"\0");

        hasher.update(b"M:");
        hasher.update(message.as_bytes());
        hasher.update(b"\0");

        CommitId(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 8 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl TryFrom<String> for CommitId {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidCommitId { commit_id: s });
        }
        Ok(CommitId(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit record stored in SurrealDB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// The commit ID (content hash)
    pub commit_id: String,
    /// Parent commit IDs, in order (empty for roots, two for merges)
    pub parents: Vec<String>,
    /// Author that created the commit
    pub author: String,
    /// Commit message
    pub message: String,
    /// Timestamp assigned by the revision store at insert time
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl CommitRecord {
    /// Create a new commit record
    pub fn new(
        commit_id: &CommitId,
        parents: &[CommitId],
        author: &str,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        CommitRecord {
            id: None,
            commit_id: commit_id.as_str().to_string(),
            parents: parents.iter().map(|p| p.as_str().to_string()).collect(),
            author: author.to_string(),
            message: message.to_string(),
            created_at,
        }
    }
}

/// Branch record - named pointer to a commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Branch name (e.g., "main", "feature/rollout")
    pub name: String,
    /// Current head commit ID
    pub head: String,
    /// Created timestamp
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl BranchRecord {
    /// Create a new branch record
    pub fn new(name: &str, head: &str) -> Self {
        let now = Utc::now();
        BranchRecord {
            id: None,
            name: name.to_string(),
            head: head.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Run record - pipeline run metadata and status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique run ID (UUID string)
    pub run_id: String,
    /// Commit this run executes against
    pub commit_id: String,
    /// Branch the commit landed on
    pub branch: String,
    /// 1-based attempt number; retries get a new run with attempt + 1
    pub attempt: u32,
    /// Run status: "pending" | "running" | "succeeded" | "failed" | "rolled_back"
    pub status: String,
    /// Stage currently executing (if running)
    pub current_stage: Option<String>,
    /// Failure reason (e.g. "cancelled by user")
    pub failure_reason: Option<String>,
    /// Created timestamp
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    /// Started timestamp (pending -> running)
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    /// Finished timestamp (if terminal)
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Create a new run record in "pending" state
    pub fn new(run_id: String, commit_id: String, branch: String, attempt: u32) -> Self {
        RunRecord {
            id: None,
            run_id,
            commit_id,
            branch,
            attempt,
            status: "pending".to_string(),
            current_stage: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition to "running"
    pub fn start(mut self) -> Self {
        self.status = "running".to_string();
        self.started_at = Some(Utc::now());
        self
    }

    /// Mark run as succeeded
    pub fn succeed(mut self) -> Self {
        self.status = "succeeded".to_string();
        self.current_stage = None;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Mark run as failed
    pub fn fail(mut self, reason: Option<String>) -> Self {
        self.status = "failed".to_string();
        self.failure_reason = reason;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Mark run as rolled back (only valid from "failed")
    pub fn roll_back(mut self) -> Self {
        self.status = "rolled_back".to_string();
        self
    }
}

/// Stage result record - one entry in a run's ordered stage sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Run ID this result belongs to
    pub run_id: String,
    /// Monotonic sequence number within run (1-indexed)
    pub seq: u64,
    /// Stage name ("build", "test", "deploy")
    pub stage: String,
    /// Outcome: "succeeded" | "failed" | "timed_out" | "rolled_back"
    pub outcome: String,
    /// Process exit code, when the stage ran a command
    pub exit_code: Option<i32>,
    /// Captured output or error detail
    pub detail: String,
    /// Stage duration in milliseconds
    pub duration_ms: u64,
    /// Record timestamp
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl StageResultRecord {
    /// Create a new stage result record
    pub fn new(
        run_id: String,
        seq: u64,
        stage: String,
        outcome: String,
        exit_code: Option<i32>,
        detail: String,
        duration_ms: u64,
    ) -> Self {
        StageResultRecord {
            id: None,
            run_id,
            seq,
            stage,
            outcome,
            exit_code,
            detail,
            duration_ms,
            recorded_at: Utc::now(),
        }
    }
}

/// Instance record - a deployable project instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Instance UUID
    pub instance_id: String,
    /// Owning project
    pub project_id: String,
    /// Currently deployed commit ID (None until first deploy)
    pub deployed: Option<String>,
    /// Desired commit ID
    pub desired: Option<String>,
    /// Health status: "unknown" | "healthy" | "unhealthy"
    pub health: String,
    /// Created timestamp
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Create a new instance record with no deployment yet
    pub fn new(instance_id: String, project_id: &str) -> Self {
        let now = Utc::now();
        InstanceRecord {
            id: None,
            instance_id,
            project_id: project_id.to_string(),
            deployed: None,
            desired: None,
            health: "unknown".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deployment record - one entry in an instance's append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    /// Instance this entry belongs to
    pub instance_id: String,
    /// Monotonic sequence number within instance (1-indexed)
    pub seq: u64,
    /// Commit that was deployed (or rolled back to)
    pub commit_id: String,
    /// Entry kind: "deploy" | "rollback"
    pub kind: String,
    /// Whether the deployment action succeeded
    pub success: bool,
    /// Record timestamp
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}
