//! Per-branch run scheduling.
//!
//! The orchestrator tracks a set of branches, each bound to one
//! deployable instance, and turns commits landing on those branches
//! into pipeline runs. Each branch gets a FIFO intake queue and a
//! semaphore capping concurrent runs (default 1, which serializes runs
//! within a branch and thus deployments to its instance). Excess
//! submissions queue, never drop; no commit is skipped.
//!
//! A failed or exhausted run never takes the orchestrator down: the
//! error is logged and published, and the branch continues with the
//! next queued commit.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use shipway_core::{EngineError, EngineEvent, EventBus, Result};
use shipway_state::storage_traits::{CommitGraph, InstanceRegistry, RunLedger};
use shipway_state::CommitId;

use crate::driver::RunDriver;

/// A branch the orchestrator schedules runs for, bound to the instance
/// its deploy stage targets.
#[derive(Debug, Clone)]
pub struct TrackedBranch {
    pub branch: String,
    pub instance_id: String,
}

struct BranchHandle {
    tx: mpsc::UnboundedSender<CommitId>,
}

/// Schedules pipeline runs per tracked branch.
pub struct Orchestrator<L: RunLedger, R: InstanceRegistry, G: CommitGraph> {
    driver: Arc<RunDriver<L, R, G>>,
    branches: HashMap<String, BranchHandle>,
    workers: Vec<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    stopped: bool,
}

impl<L, R, G> Orchestrator<L, R, G>
where
    L: RunLedger + 'static,
    R: InstanceRegistry + 'static,
    G: CommitGraph + 'static,
{
    /// Start one worker per tracked branch, each capped at `concurrency`
    /// simultaneous runs.
    pub fn new(
        driver: Arc<RunDriver<L, R, G>>,
        tracked: Vec<TrackedBranch>,
        concurrency: usize,
    ) -> Self {
        let mut branches = HashMap::new();
        let mut workers = Vec::new();

        for t in tracked {
            let (tx, rx) = mpsc::unbounded_channel();
            workers.push(spawn_branch_worker(
                Arc::clone(&driver),
                t.branch.clone(),
                t.instance_id,
                rx,
                concurrency.max(1),
            ));
            branches.insert(t.branch, BranchHandle { tx });
        }

        Self {
            driver,
            branches,
            workers,
            listener: None,
            stopped: false,
        }
    }

    /// The driver runs are scheduled through (for direct cancellation
    /// or rollback calls).
    pub fn driver(&self) -> &Arc<RunDriver<L, R, G>> {
        &self.driver
    }

    /// Enqueue a commit for a tracked branch. FIFO per branch.
    pub fn submit(&self, branch: &str, commit: CommitId) -> Result<()> {
        if self.stopped {
            return Err(EngineError::OrchestratorStopped);
        }
        let handle = self
            .branches
            .get(branch)
            .ok_or_else(|| EngineError::BranchNotFound(branch.to_string()))?;
        handle
            .tx
            .send(commit)
            .map_err(|_| EngineError::OrchestratorStopped)?;
        Ok(())
    }

    /// Listen on the engine event bus and convert `BranchUpdated` events
    /// for tracked branches into submissions.
    pub fn attach(&mut self, bus: &EventBus) {
        let senders: HashMap<String, mpsc::UnboundedSender<CommitId>> = self
            .branches
            .iter()
            .map(|(name, h)| (name.clone(), h.tx.clone()))
            .collect();
        let mut rx = bus.subscribe();

        self.listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(EngineEvent::BranchUpdated { name, new_head, .. }) => {
                        let Some(tx) = senders.get(&name) else { continue };
                        match CommitId::try_from(new_head) {
                            Ok(commit) => {
                                info!(branch = %name, commit = commit.short(), "branch update queued");
                                let _ = tx.send(commit);
                            }
                            Err(e) => warn!(branch = %name, error = %e, "malformed head in event"),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "orchestrator lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Graceful shutdown: stop intake, then wait for every in-flight
    /// and queued run to finish. Later submissions fail with
    /// `OrchestratorStopped`.
    pub async fn shutdown(&mut self) {
        self.stopped = true;
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        // Dropping the senders closes each branch queue; workers drain
        // what is already enqueued and exit.
        self.branches.clear();
        futures::future::join_all(self.workers.drain(..)).await;
        info!("orchestrator stopped");
    }
}

fn spawn_branch_worker<L, R, G>(
    driver: Arc<RunDriver<L, R, G>>,
    branch: String,
    instance_id: String,
    mut rx: mpsc::UnboundedReceiver<CommitId>,
    concurrency: usize,
) -> JoinHandle<()>
where
    L: RunLedger + 'static,
    R: InstanceRegistry + 'static,
    G: CommitGraph + 'static,
{
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut runs = JoinSet::new();

        // Strict FIFO: the next commit is popped only once a permit is
        // free, so start order always matches submission order.
        while let Some(commit) = rx.recv().await {
            while runs.try_join_next().is_some() {}

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let driver = Arc::clone(&driver);
            let branch = branch.clone();
            let instance_id = instance_id.clone();
            runs.spawn(async move {
                let _permit = permit;
                if let Err(e) = driver.run_with_retries(&branch, &commit, &instance_id).await {
                    warn!(branch = %branch, commit = commit.short(), error = %e, "pipeline run failed");
                }
            });
        }

        while runs.join_next().await.is_some() {}
    })
}
