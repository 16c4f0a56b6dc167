//! End-to-end pipeline tests: commits land in the revision store, runs
//! drive them through build/test/deploy, and instances end up on the
//! right commit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;

use shipway_core::{
    CommitMeta, Deployer, EngineError, EngineEvent, EventBus, InstanceManager, NoopDeployer,
    RevisionStore, UpdateMode,
};
use shipway_pipeline::{
    Orchestrator, RunConfig, RunDriver, Stage, StageExecutor, StageOutput, TrackedBranch,
};
use shipway_state::fakes::{MemoryCommitGraph, MemoryInstanceRegistry, MemoryRunLedger};
use shipway_state::storage_traits::{DeploymentKind, Instance, RunLedger, RunStatus, StageOutcome};
use shipway_state::CommitId;

// ============================================================
// Test doubles
// ============================================================

fn ok_output(stage: Stage) -> StageOutput {
    StageOutput {
        exit_code: 0,
        output: format!("{stage} ok"),
        success: true,
        duration_ms: 1,
    }
}

/// Always-green command stages.
struct PassExecutor;

#[async_trait]
impl StageExecutor for PassExecutor {
    async fn execute(&self, stage: Stage, _commit_id: &CommitId) -> anyhow::Result<StageOutput> {
        Ok(ok_output(stage))
    }
}

/// Test stage fails a scripted number of times, then passes.
struct FlakyExecutor {
    test_failures: AtomicU32,
}

#[async_trait]
impl StageExecutor for FlakyExecutor {
    async fn execute(&self, stage: Stage, _commit_id: &CommitId) -> anyhow::Result<StageOutput> {
        let fail = stage == Stage::Test
            && self
                .test_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        Ok(StageOutput {
            exit_code: if fail { 1 } else { 0 },
            output: format!("{stage} output"),
            success: !fail,
            duration_ms: 1,
        })
    }
}

/// Records which commit each run built, in start order.
struct RecordingExecutor {
    built: Mutex<Vec<String>>,
}

#[async_trait]
impl StageExecutor for RecordingExecutor {
    async fn execute(&self, stage: Stage, commit_id: &CommitId) -> anyhow::Result<StageOutput> {
        if stage == Stage::Build {
            self.built.lock().unwrap().push(commit_id.to_string());
        }
        Ok(ok_output(stage))
    }
}

/// Deploy blocks until released, so a second deploy can be attempted
/// while the first is provably in flight.
struct GatedDeployer {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Deployer for GatedDeployer {
    async fn deploy(&self, _instance: &Instance, _commit_id: &CommitId) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Deploys succeed except for one configurable commit, which is always
/// rejected. Models a release that a target environment refuses.
struct RejectingDeployer {
    reject: Mutex<Option<CommitId>>,
}

#[async_trait]
impl Deployer for RejectingDeployer {
    async fn deploy(&self, _instance: &Instance, commit_id: &CommitId) -> anyhow::Result<()> {
        if self.reject.lock().unwrap().as_ref() == Some(commit_id) {
            anyhow::bail!("target refused commit {}", commit_id.short());
        }
        Ok(())
    }
}

// ============================================================
// Harness
// ============================================================

struct Harness {
    revisions: RevisionStore<MemoryCommitGraph>,
    manager: Arc<InstanceManager<MemoryInstanceRegistry, MemoryCommitGraph>>,
    driver: Arc<RunDriver<MemoryRunLedger, MemoryInstanceRegistry, MemoryCommitGraph>>,
    ledger: Arc<MemoryRunLedger>,
    bus: EventBus,
    instance_id: String,
}

async fn harness(executor: Arc<dyn StageExecutor>, deployer: Arc<dyn Deployer>) -> Harness {
    let graph = Arc::new(MemoryCommitGraph::new());
    let registry = Arc::new(MemoryInstanceRegistry::new());
    let ledger = Arc::new(MemoryRunLedger::new());
    let bus = EventBus::new();

    let revisions = RevisionStore::open(Arc::clone(&graph), bus.clone())
        .await
        .unwrap();
    let manager = Arc::new(InstanceManager::new(registry, graph, bus.clone(), deployer));
    let instance = manager.register("web").await.unwrap();

    let config = RunConfig {
        max_retries: 3,
        backoff_base_ms: 1,
        stage_timeout_ms: 5_000,
    };
    let driver = Arc::new(RunDriver::new(
        Arc::clone(&ledger),
        Arc::clone(&manager),
        executor,
        bus.clone(),
        config,
    ));

    Harness {
        revisions,
        manager,
        driver,
        ledger,
        bus,
        instance_id: instance.instance_id,
    }
}

fn meta(message: &str) -> CommitMeta {
    CommitMeta {
        author: "alice".to_string(),
        message: message.to_string(),
    }
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn commit_lands_and_deploys_end_to_end() {
    let h = harness(Arc::new(PassExecutor), Arc::new(NoopDeployer)).await;

    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();
    h.revisions.create_branch("main", &c1.id).await.unwrap();

    let run_id = h
        .driver
        .run_with_retries("main", &c1.id, &h.instance_id)
        .await
        .unwrap();

    let run = h.ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let results = h.ledger.get_stage_results(&run_id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.outcome == StageOutcome::Succeeded));

    let instance = h.manager.get(&h.instance_id).await.unwrap();
    assert_eq!(instance.deployed.as_ref(), Some(&c1.id));
}

#[tokio::test]
async fn flaky_tests_recover_within_retry_budget() {
    // Test stage fails twice; the third attempt goes green.
    let h = harness(
        Arc::new(FlakyExecutor {
            test_failures: AtomicU32::new(2),
        }),
        Arc::new(NoopDeployer),
    )
    .await;

    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();
    let c2 = h
        .revisions
        .add_commit(&[c1.id.clone()], meta("fix: flaky test"))
        .await
        .unwrap();
    h.revisions.create_branch("main", &c1.id).await.unwrap();
    h.revisions
        .update_branch("main", &c2.id, UpdateMode::FastForward)
        .await
        .unwrap();

    let run_id = h
        .driver
        .run_with_retries("main", &c2.id, &h.instance_id)
        .await
        .unwrap();

    let run = h.ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.attempt, 3);
    assert_eq!(h.ledger.list_runs(Some("main")).await.unwrap().len(), 3);

    let instance = h.manager.get(&h.instance_id).await.unwrap();
    assert_eq!(instance.deployed.as_ref(), Some(&c2.id));
}

#[tokio::test]
async fn exhausted_deploy_failure_rolls_back_to_last_good_commit() {
    // C1 deploys cleanly; the environment then refuses C2 on every
    // attempt, so the retry budget runs out at the deploy stage.
    let deployer = Arc::new(RejectingDeployer {
        reject: Mutex::new(None),
    });
    let h = harness(
        Arc::new(PassExecutor),
        Arc::clone(&deployer) as Arc<dyn Deployer>,
    )
    .await;

    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();
    let c2 = h
        .revisions
        .add_commit(&[c1.id.clone()], meta("feat: bad release"))
        .await
        .unwrap();
    h.revisions.create_branch("main", &c1.id).await.unwrap();

    h.driver
        .run_with_retries("main", &c1.id, &h.instance_id)
        .await
        .unwrap();

    *deployer.reject.lock().unwrap() = Some(c2.id.clone());
    h.revisions
        .update_branch("main", &c2.id, UpdateMode::FastForward)
        .await
        .unwrap();

    let err = h
        .driver
        .run_with_retries("main", &c2.id, &h.instance_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RetriesExhausted { attempts: 3, .. }
    ));

    // The instance rolled back to the last good commit on its own.
    let instance = h.manager.get(&h.instance_id).await.unwrap();
    assert_eq!(instance.deployed.as_ref(), Some(&c1.id));
    assert_eq!(instance.desired.as_ref(), Some(&c1.id));

    // The final attempt was compensated: run RolledBack, trailing
    // rolled-back stage result, and a successful rollback history entry.
    let runs = h.ledger.list_runs(Some("main")).await.unwrap();
    let rolled_back: Vec<_> = runs
        .iter()
        .filter(|r| r.status == RunStatus::RolledBack)
        .collect();
    assert_eq!(rolled_back.len(), 1);

    let results = h
        .ledger
        .get_stage_results(&rolled_back[0].run_id)
        .await
        .unwrap();
    assert_eq!(
        results.last().unwrap().outcome,
        StageOutcome::RolledBack
    );

    let history = h.manager.history(&h.instance_id).await.unwrap();
    let last = history.last().unwrap();
    assert!(last.success);
    assert_eq!(last.kind, DeploymentKind::Rollback);
    assert_eq!(last.commit_id, c1.id);
}

#[tokio::test]
async fn concurrent_deploys_to_one_instance_rejected() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness(
        Arc::new(PassExecutor),
        Arc::new(GatedDeployer {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        }),
    )
    .await;

    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();

    let first = {
        let manager = Arc::clone(&h.manager);
        let instance_id = h.instance_id.clone();
        let commit = c1.id.clone();
        tokio::spawn(async move { manager.deploy(&instance_id, &commit).await })
    };
    entered.notified().await;

    let err = h.manager.deploy(&h.instance_id, &c1.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyDeploying(_)));

    release.notify_one();
    first.await.unwrap().unwrap();

    // The slot frees once the first deploy settles
    h.manager.deploy(&h.instance_id, &c1.id).await.unwrap();
}

#[tokio::test]
async fn events_follow_run_lifecycle() {
    let h = harness(Arc::new(PassExecutor), Arc::new(NoopDeployer)).await;
    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();
    h.revisions.create_branch("main", &c1.id).await.unwrap();

    let mut rx = h.bus.subscribe();
    h.driver
        .execute_once("main", &c1.id, &h.instance_id, 1)
        .await
        .unwrap();

    let mut events = Vec::new();
    for _ in 0..7 {
        events.push(rx.recv().await.unwrap());
    }

    assert!(matches!(&events[0], EngineEvent::RunQueued { branch, attempt: 1, .. } if branch == "main"));
    assert!(matches!(&events[1], EngineEvent::RunStarted { .. }));
    assert!(matches!(&events[2], EngineEvent::StageCompleted { stage, outcome: StageOutcome::Succeeded, .. } if stage == "build"));
    assert!(matches!(&events[3], EngineEvent::StageCompleted { stage, .. } if stage == "test"));
    assert!(matches!(&events[4], EngineEvent::InstanceDeployed { commit_id, .. } if *commit_id == c1.id.to_string()));
    assert!(matches!(&events[5], EngineEvent::StageCompleted { stage, .. } if stage == "deploy"));
    assert!(matches!(&events[6], EngineEvent::RunCompleted { success: true, .. }));
}

#[tokio::test]
async fn orchestrator_preserves_submission_order() {
    let executor = Arc::new(RecordingExecutor {
        built: Mutex::new(Vec::new()),
    });
    let h = harness(
        Arc::clone(&executor) as Arc<dyn StageExecutor>,
        Arc::new(NoopDeployer),
    )
    .await;

    let mut parents = Vec::new();
    let mut commits = Vec::new();
    for i in 0..5 {
        let commit = h
            .revisions
            .add_commit(&parents, meta(&format!("change {i}")))
            .await
            .unwrap();
        parents = vec![commit.id.clone()];
        commits.push(commit.id);
    }

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&h.driver),
        vec![TrackedBranch {
            branch: "main".to_string(),
            instance_id: h.instance_id.clone(),
        }],
        1,
    );
    for commit in &commits {
        orchestrator.submit("main", commit.clone()).unwrap();
    }
    // Shutdown stops intake but drains everything already queued.
    orchestrator.shutdown().await;

    let built = executor.built.lock().unwrap().clone();
    let submitted: Vec<String> = commits.iter().map(|c| c.to_string()).collect();
    assert_eq!(built, submitted);

    let runs = h.ledger.list_runs(Some("main")).await.unwrap();
    assert_eq!(runs.len(), 5);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
}

#[tokio::test]
async fn orchestrator_rejects_untracked_branch() {
    let h = harness(Arc::new(PassExecutor), Arc::new(NoopDeployer)).await;
    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();

    let mut orchestrator = Orchestrator::new(Arc::clone(&h.driver), Vec::new(), 1);
    let err = orchestrator.submit("main", c1.id).unwrap_err();
    assert!(matches!(err, EngineError::BranchNotFound(_)));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn submissions_after_shutdown_are_rejected() {
    let h = harness(Arc::new(PassExecutor), Arc::new(NoopDeployer)).await;
    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&h.driver),
        vec![TrackedBranch {
            branch: "main".to_string(),
            instance_id: h.instance_id.clone(),
        }],
        1,
    );
    orchestrator.shutdown().await;

    // The branch is still tracked; the error names the real condition.
    let err = orchestrator.submit("main", c1.id).unwrap_err();
    assert!(matches!(err, EngineError::OrchestratorStopped));
}

#[tokio::test]
async fn branch_update_triggers_run_through_the_bus() {
    let h = harness(Arc::new(PassExecutor), Arc::new(NoopDeployer)).await;

    let c1 = h.revisions.add_commit(&[], meta("feat: init")).await.unwrap();
    let c2 = h
        .revisions
        .add_commit(&[c1.id.clone()], meta("feat: next"))
        .await
        .unwrap();
    h.revisions.create_branch("main", &c1.id).await.unwrap();

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&h.driver),
        vec![TrackedBranch {
            branch: "main".to_string(),
            instance_id: h.instance_id.clone(),
        }],
        1,
    );
    orchestrator.attach(&h.bus);

    let mut rx = h.bus.subscribe();
    h.revisions
        .update_branch("main", &c2.id, UpdateMode::FastForward)
        .await
        .unwrap();

    let completed = timeout(Duration::from_secs(5), async {
        loop {
            if let EngineEvent::RunCompleted { success, .. } = rx.recv().await.unwrap() {
                break success;
            }
        }
    })
    .await
    .unwrap();
    assert!(completed);

    orchestrator.shutdown().await;
    let instance = h.manager.get(&h.instance_id).await.unwrap();
    assert_eq!(instance.deployed.as_ref(), Some(&c2.id));
}
