//! Trait contract tests for CommitGraph, RunLedger, and InstanceRegistry.
//!
//! These tests verify the behavioral contracts of the storage traits
//! using in-memory fakes. Any conforming implementation must pass these.

use chrono::Utc;
use shipway_state::fakes::{MemoryCommitGraph, MemoryInstanceRegistry, MemoryRunLedger};
use shipway_state::storage_traits::*;
use shipway_state::{CommitId, StorageError, SurrealStore};

fn commit_with(parents: &[CommitId], author: &str, message: &str) -> Commit {
    Commit {
        id: CommitId::compute(parents, author, message),
        parents: parents.to_vec(),
        author: author.to_string(),
        message: message.to_string(),
        timestamp: Utc::now(),
    }
}

fn root_commit() -> Commit {
    commit_with(&[], "alice", "initial")
}

fn stage_result(seq: u64, stage: &str, outcome: StageOutcome) -> StageResult {
    StageResult {
        seq,
        stage: stage.to_string(),
        outcome,
        exit_code: Some(0),
        detail: format!("{stage} output"),
        duration_ms: 42,
    }
}

// ===========================================================================
// CommitGraph contract tests
// ===========================================================================

#[tokio::test]
async fn graph_put_and_get_round_trip() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();

    graph.put_commit(&commit).await.unwrap();
    let fetched = graph.get_commit(&commit.id).await.unwrap().unwrap();

    assert_eq!(fetched.id, commit.id);
    assert_eq!(fetched.parents, commit.parents);
    assert_eq!(fetched.author, "alice");
    assert_eq!(fetched.message, "initial");
}

#[tokio::test]
async fn graph_get_missing_commit_is_none() {
    let graph = MemoryCommitGraph::new();
    let bogus = CommitId::compute(&[], "nobody", "not stored");

    assert!(graph.get_commit(&bogus).await.unwrap().is_none());
    assert!(!graph.contains_commit(&bogus).await.unwrap());
}

#[tokio::test]
async fn graph_put_commit_is_idempotent() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();

    let first = graph.put_commit(&commit).await.unwrap();
    let second = graph.put_commit(&commit).await.unwrap();

    // The stored commit keeps its original timestamp
    assert_eq!(first.id, second.id);
    assert_eq!(first.timestamp, second.timestamp);
}

#[tokio::test]
async fn graph_contains_after_put() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();
    graph.put_commit(&commit).await.unwrap();

    assert!(graph.contains_commit(&commit.id).await.unwrap());
}

#[tokio::test]
async fn graph_latest_timestamp_tracks_max() {
    let graph = MemoryCommitGraph::new();
    assert!(graph.latest_timestamp().await.unwrap().is_none());

    let root = root_commit();
    graph.put_commit(&root).await.unwrap();

    let mut child = commit_with(&[root.id.clone()], "bob", "child");
    child.timestamp = root.timestamp + chrono::Duration::seconds(5);
    graph.put_commit(&child).await.unwrap();

    let latest = graph.latest_timestamp().await.unwrap().unwrap();
    assert_eq!(latest, child.timestamp);
}

#[tokio::test]
async fn graph_create_branch_and_get() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();
    graph.put_commit(&commit).await.unwrap();

    let branch = graph.create_branch("main", &commit.id).await.unwrap();
    assert_eq!(branch.name, "main");
    assert_eq!(branch.head, commit.id);

    let fetched = graph.get_branch("main").await.unwrap().unwrap();
    assert_eq!(fetched.head, commit.id);
}

#[tokio::test]
async fn graph_create_branch_rejects_duplicate_name() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();
    graph.put_commit(&commit).await.unwrap();
    graph.create_branch("main", &commit.id).await.unwrap();

    let err = graph.create_branch("main", &commit.id).await.unwrap_err();
    assert!(matches!(err, StorageError::BranchExists { .. }));
}

#[tokio::test]
async fn graph_set_branch_head_moves_pointer() {
    let graph = MemoryCommitGraph::new();
    let root = root_commit();
    let child = commit_with(&[root.id.clone()], "alice", "second");
    graph.put_commit(&root).await.unwrap();
    graph.put_commit(&child).await.unwrap();
    graph.create_branch("main", &root.id).await.unwrap();

    let updated = graph.set_branch_head("main", &child.id).await.unwrap();
    assert_eq!(updated.head, child.id);
}

#[tokio::test]
async fn graph_set_head_of_missing_branch_fails() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();
    graph.put_commit(&commit).await.unwrap();

    let err = graph.set_branch_head("ghost", &commit.id).await.unwrap_err();
    assert!(matches!(err, StorageError::BranchNotFound { .. }));
}

#[tokio::test]
async fn graph_list_branches_ordered_by_name() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();
    graph.put_commit(&commit).await.unwrap();
    graph.create_branch("release", &commit.id).await.unwrap();
    graph.create_branch("main", &commit.id).await.unwrap();
    graph.create_branch("dev", &commit.id).await.unwrap();

    let names: Vec<String> = graph
        .list_branches()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(names, vec!["dev", "main", "release"]);
}

#[tokio::test]
async fn graph_delete_branch_removes_pointer_only() {
    let graph = MemoryCommitGraph::new();
    let commit = root_commit();
    graph.put_commit(&commit).await.unwrap();
    graph.create_branch("scratch", &commit.id).await.unwrap();

    graph.delete_branch("scratch").await.unwrap();
    assert!(graph.get_branch("scratch").await.unwrap().is_none());
    // The commit itself survives
    assert!(graph.contains_commit(&commit.id).await.unwrap());
}

#[tokio::test]
async fn graph_delete_missing_branch_fails() {
    let graph = MemoryCommitGraph::new();
    let err = graph.delete_branch("nonexistent").await.unwrap_err();
    assert!(matches!(err, StorageError::BranchNotFound { .. }));
}

// ===========================================================================
// RunLedger contract tests
// ===========================================================================

fn sample_commit_id() -> CommitId {
    CommitId::compute(&[], "ci", "pipeline target")
}

#[tokio::test]
async fn ledger_create_run_returns_unique_ids() {
    let ledger = MemoryRunLedger::new();
    let cid = sample_commit_id();

    let id1 = ledger.create_run(&cid, "main", 1).await.unwrap();
    let id2 = ledger.create_run(&cid, "main", 2).await.unwrap();

    assert_ne!(id1, id2);
}

#[tokio::test]
async fn ledger_created_run_is_pending() {
    let ledger = MemoryRunLedger::new();
    let cid = sample_commit_id();
    let run_id = ledger.create_run(&cid, "main", 1).await.unwrap();

    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.run_id, run_id);
    assert_eq!(run.commit_id, cid);
    assert_eq!(run.branch, "main");
    assert_eq!(run.attempt, 1);
    assert_eq!(run.status, RunStatus::Pending);
    assert!(run.started_at.is_none());
    assert!(run.finished_at.is_none());
}

#[tokio::test]
async fn ledger_get_run_not_found() {
    let ledger = MemoryRunLedger::new();
    let bogus = RunId("nonexistent".to_string());
    let err = ledger.get_run(&bogus).await.unwrap_err();

    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

#[tokio::test]
async fn ledger_start_run_transitions_to_running() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();

    ledger.start_run(&run_id).await.unwrap();
    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.started_at.is_some());
}

#[tokio::test]
async fn ledger_cannot_start_run_twice() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();

    let err = ledger.start_run(&run_id).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

#[tokio::test]
async fn ledger_stage_results_ordered_by_seq() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();

    ledger
        .append_stage_result(&run_id, stage_result(1, "build", StageOutcome::Succeeded))
        .await
        .unwrap();
    ledger
        .append_stage_result(&run_id, stage_result(2, "test", StageOutcome::Succeeded))
        .await
        .unwrap();
    ledger
        .append_stage_result(&run_id, stage_result(3, "deploy", StageOutcome::Succeeded))
        .await
        .unwrap();

    let results = ledger.get_stage_results(&run_id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].stage, "build");
    assert_eq!(results[1].stage, "test");
    assert_eq!(results[2].stage, "deploy");
    assert!(results.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn ledger_cannot_append_to_pending_run() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();

    let err = ledger
        .append_stage_result(&run_id, stage_result(1, "build", StageOutcome::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

#[tokio::test]
async fn ledger_complete_run_sets_status() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();

    ledger.complete_run(&run_id).await.unwrap();
    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.finished_at.is_some());
    assert!(run.current_stage.is_none());
}

#[tokio::test]
async fn ledger_fail_run_records_reason() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();

    ledger
        .fail_run(&run_id, Some("tests exited 1".to_string()))
        .await
        .unwrap();
    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failure_reason.as_deref(), Some("tests exited 1"));
}

#[tokio::test]
async fn ledger_cannot_append_to_terminal_run() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();
    ledger.complete_run(&run_id).await.unwrap();

    let err = ledger
        .append_stage_result(&run_id, stage_result(4, "late", StageOutcome::Succeeded))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

#[tokio::test]
async fn ledger_cannot_complete_twice() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();
    ledger.complete_run(&run_id).await.unwrap();

    let err = ledger.complete_run(&run_id).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

#[tokio::test]
async fn ledger_roll_back_requires_failed() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();

    // Running run cannot be rolled back
    let err = ledger
        .roll_back_run(&run_id, stage_result(2, "deploy", StageOutcome::RolledBack))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

#[tokio::test]
async fn ledger_roll_back_appends_compensating_stage() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(&sample_commit_id(), "main", 1)
        .await
        .unwrap();
    ledger.start_run(&run_id).await.unwrap();
    ledger
        .append_stage_result(&run_id, stage_result(1, "deploy", StageOutcome::Failed))
        .await
        .unwrap();
    ledger
        .fail_run(&run_id, Some("deploy failed".to_string()))
        .await
        .unwrap();

    ledger
        .roll_back_run(&run_id, stage_result(2, "deploy", StageOutcome::RolledBack))
        .await
        .unwrap();

    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::RolledBack);

    let results = ledger.get_stage_results(&run_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].outcome, StageOutcome::RolledBack);
}

#[tokio::test]
async fn ledger_list_runs_newest_first() {
    let ledger = MemoryRunLedger::new();
    let cid = sample_commit_id();
    let first = ledger.create_run(&cid, "main", 1).await.unwrap();
    let second = ledger.create_run(&cid, "main", 2).await.unwrap();

    let all = ledger.list_runs(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].run_id, second);
    assert_eq!(all[1].run_id, first);
}

#[tokio::test]
async fn ledger_list_runs_filtered_by_branch() {
    let ledger = MemoryRunLedger::new();
    let cid = sample_commit_id();
    ledger.create_run(&cid, "main", 1).await.unwrap();
    ledger.create_run(&cid, "main", 1).await.unwrap();
    ledger.create_run(&cid, "dev", 1).await.unwrap();

    let filtered = ledger.list_runs(Some("main")).await.unwrap();
    assert_eq!(filtered.len(), 2);
    assert!(filtered.iter().all(|r| r.branch == "main"));
}

// ===========================================================================
// InstanceRegistry contract tests
// ===========================================================================

fn deploy_entry(seq: u64, commit_id: &CommitId, kind: DeploymentKind) -> DeploymentEntry {
    DeploymentEntry {
        seq,
        commit_id: commit_id.clone(),
        kind,
        success: true,
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn registry_register_creates_instance() {
    let reg = MemoryInstanceRegistry::new();
    let instance = reg.register("web-app").await.unwrap();

    assert_eq!(instance.project_id, "web-app");
    assert!(instance.deployed.is_none());
    assert!(instance.desired.is_none());
    assert_eq!(instance.health, HealthStatus::Unknown);
}

#[tokio::test]
async fn registry_register_assigns_unique_ids() {
    let reg = MemoryInstanceRegistry::new();
    let a = reg.register("web-app").await.unwrap();
    let b = reg.register("web-app").await.unwrap();

    assert_ne!(a.instance_id, b.instance_id);
}

#[tokio::test]
async fn registry_get_missing_instance_fails() {
    let reg = MemoryInstanceRegistry::new();
    let err = reg.get("nonexistent").await.unwrap_err();
    assert!(matches!(err, StorageError::InstanceNotFound { .. }));
}

#[tokio::test]
async fn registry_mark_deployed_updates_state() {
    let reg = MemoryInstanceRegistry::new();
    let instance = reg.register("web-app").await.unwrap();
    let cid = sample_commit_id();

    reg.set_desired(&instance.instance_id, &cid).await.unwrap();
    reg.mark_deployed(&instance.instance_id, &cid).await.unwrap();

    let updated = reg.get(&instance.instance_id).await.unwrap();
    assert_eq!(updated.deployed.as_ref(), Some(&cid));
    assert_eq!(updated.desired.as_ref(), Some(&cid));
    assert_eq!(updated.health, HealthStatus::Healthy);
}

#[tokio::test]
async fn registry_mark_unhealthy_keeps_deployed() {
    let reg = MemoryInstanceRegistry::new();
    let instance = reg.register("web-app").await.unwrap();
    let cid = sample_commit_id();
    reg.mark_deployed(&instance.instance_id, &cid).await.unwrap();

    reg.mark_unhealthy(&instance.instance_id).await.unwrap();

    let updated = reg.get(&instance.instance_id).await.unwrap();
    assert_eq!(updated.health, HealthStatus::Unhealthy);
    // A failed later deploy does not clobber what is actually running
    assert_eq!(updated.deployed.as_ref(), Some(&cid));
}

#[tokio::test]
async fn registry_deployment_history_ordered_and_append_only() {
    let reg = MemoryInstanceRegistry::new();
    let instance = reg.register("web-app").await.unwrap();
    let c1 = CommitId::compute(&[], "alice", "v1");
    let c2 = CommitId::compute(&[], "alice", "v2");

    reg.append_deployment(&instance.instance_id, deploy_entry(1, &c1, DeploymentKind::Deploy))
        .await
        .unwrap();
    reg.append_deployment(&instance.instance_id, deploy_entry(2, &c2, DeploymentKind::Deploy))
        .await
        .unwrap();
    // Rollback appends rather than rewriting history
    reg.append_deployment(
        &instance.instance_id,
        deploy_entry(3, &c1, DeploymentKind::Rollback),
    )
    .await
    .unwrap();

    let history = reg.deployments(&instance.instance_id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].commit_id, c1);
    assert_eq!(history[1].commit_id, c2);
    assert_eq!(history[2].commit_id, c1);
    assert_eq!(history[2].kind, DeploymentKind::Rollback);
}

#[tokio::test]
async fn registry_list_returns_all_instances() {
    let reg = MemoryInstanceRegistry::new();
    reg.register("web").await.unwrap();
    reg.register("api").await.unwrap();

    let all = reg.list().await.unwrap();
    assert_eq!(all.len(), 2);
}

// ===========================================================================
// SurrealStore contract tests (mirrors the fake-backed tests above)
// ===========================================================================

mod surreal_store_tests {
    use super::*;

    async fn store() -> SurrealStore {
        SurrealStore::in_memory().await.expect("in_memory() failed")
    }

    #[tokio::test]
    async fn put_commit_is_idempotent() {
        let store = store().await;
        let commit = root_commit();

        let first = store.put_commit(&commit).await.unwrap();
        let second = store.put_commit(&commit).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(store.contains_commit(&commit.id).await.unwrap());
    }

    #[tokio::test]
    async fn branch_lifecycle() {
        let store = store().await;
        let root = root_commit();
        let child = commit_with(&[root.id.clone()], "alice", "second");
        store.put_commit(&root).await.unwrap();
        store.put_commit(&child).await.unwrap();

        store.create_branch("main", &root.id).await.unwrap();
        let moved = store.set_branch_head("main", &child.id).await.unwrap();
        assert_eq!(moved.head, child.id);

        store.delete_branch("main").await.unwrap();
        assert!(store.get_branch("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_lifecycle_with_guarded_transitions() {
        let store = store().await;
        let cid = sample_commit_id();
        let run_id = store.create_run(&cid, "main", 1).await.unwrap();

        // Appending before start is rejected
        let err = store
            .append_stage_result(&run_id, stage_result(1, "build", StageOutcome::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));

        store.start_run(&run_id).await.unwrap();
        store.set_current_stage(&run_id, "build").await.unwrap();
        store
            .append_stage_result(&run_id, stage_result(1, "build", StageOutcome::Succeeded))
            .await
            .unwrap();
        store.complete_run(&run_id).await.unwrap();

        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let results = store.get_stage_results(&run_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].stage, "build");
    }

    #[tokio::test]
    async fn failed_run_rolls_back_with_compensation() {
        let store = store().await;
        let run_id = store
            .create_run(&sample_commit_id(), "main", 1)
            .await
            .unwrap();
        store.start_run(&run_id).await.unwrap();
        store
            .append_stage_result(&run_id, stage_result(1, "deploy", StageOutcome::Failed))
            .await
            .unwrap();
        store
            .fail_run(&run_id, Some("deploy failed".to_string()))
            .await
            .unwrap();

        store
            .roll_back_run(&run_id, stage_result(2, "deploy", StageOutcome::RolledBack))
            .await
            .unwrap();

        let run = store.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::RolledBack);
        let results = store.get_stage_results(&run_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].outcome, StageOutcome::RolledBack);
    }

    #[tokio::test]
    async fn list_runs_filtered_by_branch() {
        let store = store().await;
        let cid = sample_commit_id();
        store.create_run(&cid, "main", 1).await.unwrap();
        store.create_run(&cid, "dev", 1).await.unwrap();

        let filtered = store.list_runs(Some("main")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].branch, "main");
    }

    #[tokio::test]
    async fn instance_deploy_and_history() {
        let store = store().await;
        let instance = store.register("web-app").await.unwrap();
        let cid = sample_commit_id();

        store.set_desired(&instance.instance_id, &cid).await.unwrap();
        store
            .mark_deployed(&instance.instance_id, &cid)
            .await
            .unwrap();
        store
            .append_deployment(
                &instance.instance_id,
                deploy_entry(1, &cid, DeploymentKind::Deploy),
            )
            .await
            .unwrap();

        let fetched = store.get(&instance.instance_id).await.unwrap();
        assert_eq!(fetched.deployed.as_ref(), Some(&cid));
        assert_eq!(fetched.health, HealthStatus::Healthy);

        let history = store.deployments(&instance.instance_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, DeploymentKind::Deploy);
    }
}
