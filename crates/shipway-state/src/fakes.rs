//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryCommitGraph`, `MemoryRunLedger`, and
//! `MemoryInstanceRegistry` that satisfy the trait contracts without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::schema::CommitId;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryCommitGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GraphState {
    commits: HashMap<String, Commit>,
    branches: HashMap<String, Branch>,
}

/// In-memory commit graph backed by `HashMap`s.
#[derive(Debug, Default)]
pub struct MemoryCommitGraph {
    state: Mutex<GraphState>,
}

impl MemoryCommitGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitGraph for MemoryCommitGraph {
    async fn put_commit(&self, commit: &Commit) -> StorageResult<Commit> {
        let mut state = self.state.lock().unwrap();
        // Content-addressed: an existing id wins, the new write is a no-op.
        let stored = state
            .commits
            .entry(commit.id.as_str().to_string())
            .or_insert_with(|| commit.clone());
        Ok(stored.clone())
    }

    async fn get_commit(&self, id: &CommitId) -> StorageResult<Option<Commit>> {
        let state = self.state.lock().unwrap();
        Ok(state.commits.get(id.as_str()).cloned())
    }

    async fn contains_commit(&self, id: &CommitId) -> StorageResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.commits.contains_key(id.as_str()))
    }

    async fn latest_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        Ok(state.commits.values().map(|c| c.timestamp).max())
    }

    async fn create_branch(&self, name: &str, head: &CommitId) -> StorageResult<Branch> {
        let mut state = self.state.lock().unwrap();
        if state.branches.contains_key(name) {
            return Err(StorageError::BranchExists {
                name: name.to_string(),
            });
        }
        let now = Utc::now();
        let branch = Branch {
            name: name.to_string(),
            head: head.clone(),
            created_at: now,
            updated_at: now,
        };
        state.branches.insert(name.to_string(), branch.clone());
        Ok(branch)
    }

    async fn set_branch_head(&self, name: &str, head: &CommitId) -> StorageResult<Branch> {
        let mut state = self.state.lock().unwrap();
        let branch = state
            .branches
            .get_mut(name)
            .ok_or_else(|| StorageError::BranchNotFound {
                name: name.to_string(),
            })?;
        branch.head = head.clone();
        branch.updated_at = Utc::now();
        Ok(branch.clone())
    }

    async fn get_branch(&self, name: &str) -> StorageResult<Option<Branch>> {
        let state = self.state.lock().unwrap();
        Ok(state.branches.get(name).cloned())
    }

    async fn list_branches(&self) -> StorageResult<Vec<Branch>> {
        let state = self.state.lock().unwrap();
        let mut branches: Vec<Branch> = state.branches.values().cloned().collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    async fn delete_branch(&self, name: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .branches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::BranchNotFound {
                name: name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: PipelineRun,
    stages: Vec<StageResult>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn require_status(
    record: &PipelineRun,
    expected: RunStatus,
) -> std::result::Result<(), StorageError> {
    if record.status != expected {
        return Err(StorageError::InvalidRunState {
            run_id: record.run_id.0.clone(),
            status: record.status.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        commit_id: &CommitId,
        branch: &str,
        attempt: u32,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = PipelineRun {
            run_id: run_id.clone(),
            commit_id: commit_id.clone(),
            branch: branch.to_string(),
            attempt,
            status: RunStatus::Pending,
            current_stage: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                stages: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn start_run(&self, run_id: &RunId) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        require_status(&state.record, RunStatus::Pending)?;
        state.record.status = RunStatus::Running;
        state.record.started_at = Some(Utc::now());
        Ok(())
    }

    async fn set_current_stage(&self, run_id: &RunId, stage: &str) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        require_status(&state.record, RunStatus::Running)?;
        state.record.current_stage = Some(stage.to_string());
        Ok(())
    }

    async fn append_stage_result(&self, run_id: &RunId, result: StageResult) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        require_status(&state.record, RunStatus::Running)?;
        state.stages.push(result);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        require_status(&state.record, RunStatus::Running)?;
        state.record.status = RunStatus::Succeeded;
        state.record.current_stage = None;
        state.record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_run(&self, run_id: &RunId, reason: Option<String>) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        require_status(&state.record, RunStatus::Running)?;
        state.record.status = RunStatus::Failed;
        state.record.failure_reason = reason;
        state.record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn roll_back_run(&self, run_id: &RunId, compensation: StageResult) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        require_status(&state.record, RunStatus::Failed)?;
        state.stages.push(compensation);
        state.record.status = RunStatus::RolledBack;
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRun> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResult>> {
        let runs = self.runs.lock().unwrap();
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut stages = state.stages.clone();
        stages.sort_by_key(|s| s.seq);
        Ok(stages)
    }

    async fn list_runs(&self, branch: Option<&str>) -> StorageResult<Vec<PipelineRun>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<PipelineRun> = runs
            .values()
            .filter(|s| branch.map(|b| s.record.branch == b).unwrap_or(true))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// MemoryInstanceRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InstanceState {
    record: Instance,
    deployments: Vec<DeploymentEntry>,
}

/// In-memory instance registry backed by a `HashMap<instance_id, state>`.
#[derive(Debug, Default)]
pub struct MemoryInstanceRegistry {
    instances: Mutex<HashMap<String, InstanceState>>,
}

impl MemoryInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRegistry for MemoryInstanceRegistry {
    async fn register(&self, project_id: &str) -> StorageResult<Instance> {
        let now = Utc::now();
        let record = Instance {
            instance_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            deployed: None,
            desired: None,
            health: HealthStatus::Unknown,
            created_at: now,
            updated_at: now,
        };
        let mut instances = self.instances.lock().unwrap();
        instances.insert(
            record.instance_id.clone(),
            InstanceState {
                record: record.clone(),
                deployments: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn get(&self, instance_id: &str) -> StorageResult<Instance> {
        let instances = self.instances.lock().unwrap();
        instances
            .get(instance_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    async fn list(&self) -> StorageResult<Vec<Instance>> {
        let instances = self.instances.lock().unwrap();
        let mut records: Vec<Instance> = instances.values().map(|s| s.record.clone()).collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    async fn set_desired(&self, instance_id: &str, commit_id: &CommitId) -> StorageResult<()> {
        let mut instances = self.instances.lock().unwrap();
        let state =
            instances
                .get_mut(instance_id)
                .ok_or_else(|| StorageError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        state.record.desired = Some(commit_id.clone());
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_deployed(&self, instance_id: &str, commit_id: &CommitId) -> StorageResult<()> {
        let mut instances = self.instances.lock().unwrap();
        let state =
            instances
                .get_mut(instance_id)
                .ok_or_else(|| StorageError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        state.record.deployed = Some(commit_id.clone());
        state.record.health = HealthStatus::Healthy;
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_unhealthy(&self, instance_id: &str) -> StorageResult<()> {
        let mut instances = self.instances.lock().unwrap();
        let state =
            instances
                .get_mut(instance_id)
                .ok_or_else(|| StorageError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        state.record.health = HealthStatus::Unhealthy;
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_deployment(
        &self,
        instance_id: &str,
        entry: DeploymentEntry,
    ) -> StorageResult<()> {
        let mut instances = self.instances.lock().unwrap();
        let state =
            instances
                .get_mut(instance_id)
                .ok_or_else(|| StorageError::InstanceNotFound {
                    instance_id: instance_id.to_string(),
                })?;
        state.deployments.push(entry);
        Ok(())
    }

    async fn deployments(&self, instance_id: &str) -> StorageResult<Vec<DeploymentEntry>> {
        let instances = self.instances.lock().unwrap();
        let state = instances
            .get(instance_id)
            .ok_or_else(|| StorageError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let mut deployments = state.deployments.clone();
        deployments.sort_by_key(|d| d.seq);
        Ok(deployments)
    }
}
