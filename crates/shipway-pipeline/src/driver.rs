//! Pipeline run driver.
//!
//! One [`RunDriver`] owns the lifecycle of pipeline runs: it records a
//! `Pending` run, transitions it to `Running`, executes the fixed stage
//! sequence with a per-stage deadline, and settles the run as
//! `Succeeded` or `Failed`. A retry wrapper re-runs failed pipelines as
//! whole new runs (new id, attempt + 1) with exponential backoff, and
//! triggers an automatic instance rollback when a deploy failure
//! exhausts the retry budget.
//!
//! Cancellation is cooperative and lands between stages only: each live
//! run has a `watch`-backed cancel flag that the driver checks before
//! starting the next stage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use shipway_core::{EngineError, EngineEvent, EventBus, InstanceManager, Result, METRICS};
use shipway_state::storage_traits::{
    CommitGraph, InstanceRegistry, RunLedger, RunStatus, StageOutcome, StageResult,
};
use shipway_state::{CommitId, RunId, StorageError};

use crate::executor::StageExecutor;
use crate::stage::Stage;

/// Pipeline knobs the driver needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum total attempts per commit (first run included).
    pub max_retries: u32,

    /// Base backoff; attempt N sleeps `backoff_base_ms * 2^(N-1)`.
    pub backoff_base_ms: u64,

    /// Per-stage execution deadline in milliseconds.
    pub stage_timeout_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            stage_timeout_ms: 300_000,
        }
    }
}

impl RunConfig {
    /// Extract the pipeline knobs from a full engine config.
    pub fn from_engine(config: &shipway_core::EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            stage_timeout_ms: config.stage_timeout_ms,
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Drives pipeline runs against the ledger, the stage executor, and the
/// instance manager.
pub struct RunDriver<L: RunLedger, R: InstanceRegistry, G: CommitGraph> {
    ledger: Arc<L>,
    manager: Arc<InstanceManager<R, G>>,
    executor: Arc<dyn StageExecutor>,
    bus: EventBus,
    config: RunConfig,
    /// Cancel flags for live runs, keyed by run id.
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl<L: RunLedger, R: InstanceRegistry, G: CommitGraph> RunDriver<L, R, G> {
    pub fn new(
        ledger: Arc<L>,
        manager: Arc<InstanceManager<R, G>>,
        executor: Arc<dyn StageExecutor>,
        bus: EventBus,
        config: RunConfig,
    ) -> Self {
        Self {
            ledger,
            manager,
            executor,
            bus,
            config,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Execute the pipeline for a commit, retrying failed attempts as
    /// whole new runs up to the configured bound.
    ///
    /// Returns the id of the successful run. Cancellation and
    /// non-retryable errors surface immediately; exhausting the budget
    /// on a deploy failure triggers an automatic instance rollback
    /// before `RetriesExhausted` is returned.
    #[instrument(skip(self), fields(commit = commit_id.short()))]
    pub async fn run_with_retries(
        &self,
        branch: &str,
        commit_id: &CommitId,
        instance_id: &str,
    ) -> Result<RunId> {
        let mut attempt = 1u32;
        loop {
            let (run_id, outcome) = self
                .run_once(branch, commit_id, instance_id, attempt)
                .await?;
            let err = match outcome {
                Ok(()) => return Ok(run_id),
                Err(e @ EngineError::CancelledByUser { .. }) => return Err(e),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries {
                self.bus.publish(EngineEvent::RetriesExhausted {
                    branch: branch.to_string(),
                    commit_id: commit_id.to_string(),
                    attempts: attempt,
                });
                warn!(branch, attempts = attempt, error = %err, "retries exhausted");

                if is_deploy_failure(&err) {
                    if let Err(rb) = self.rollback_run(&run_id, instance_id).await {
                        warn!(run_id = %run_id, error = %rb, "automatic rollback failed");
                    }
                }
                return Err(EngineError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.config.backoff_for_attempt(attempt);
            METRICS.inc_retries_scheduled();
            self.bus.publish(EngineEvent::RetryScheduled {
                branch: branch.to_string(),
                commit_id: commit_id.to_string(),
                next_attempt: attempt + 1,
                delay_ms: delay.as_millis() as u64,
            });
            info!(branch, next_attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "retry scheduled");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Execute a single pipeline run without retries.
    pub async fn execute_once(
        &self,
        branch: &str,
        commit_id: &CommitId,
        instance_id: &str,
        attempt: u32,
    ) -> Result<RunId> {
        let (run_id, outcome) = self
            .run_once(branch, commit_id, instance_id, attempt)
            .await?;
        outcome.map(|_| run_id)
    }

    /// Request cancellation of a live run. Takes effect before the next
    /// stage starts; returns false if the run is not currently live.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let cancels = match self.cancels.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match cancels.get(&run_id.0) {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }

    /// Roll back a failed run that attempted a deploy.
    ///
    /// Restores the instance to its prior successful deployment, appends
    /// the compensating `RolledBack` stage result, and transitions the
    /// run `Failed -> RolledBack`.
    #[instrument(skip(self))]
    pub async fn rollback_run(&self, run_id: &RunId, instance_id: &str) -> Result<CommitId> {
        let run = self.ledger.get_run(run_id).await.map_err(run_miss)?;
        if run.status != RunStatus::Failed {
            return Err(EngineError::NothingToRollBack {
                run_id: run_id.clone(),
            });
        }
        let results = self
            .ledger
            .get_stage_results(run_id)
            .await
            .map_err(run_miss)?;
        if !results.iter().any(|r| r.stage == Stage::Deploy.name()) {
            return Err(EngineError::NothingToRollBack {
                run_id: run_id.clone(),
            });
        }

        let target = self.manager.rollback(instance_id).await?;
        let compensation = StageResult {
            seq: results.len() as u64 + 1,
            stage: Stage::Deploy.name().to_string(),
            outcome: StageOutcome::RolledBack,
            exit_code: None,
            detail: format!("rolled back to {}", target.short()),
            duration_ms: 0,
        };
        self.ledger.roll_back_run(run_id, compensation).await?;
        info!(run_id = %run_id, target = target.short(), "run rolled back");
        Ok(target)
    }

    /// One attempt: create the run, drive it, settle the outcome.
    /// The outer error means the run could not even be created.
    async fn run_once(
        &self,
        branch: &str,
        commit_id: &CommitId,
        instance_id: &str,
        attempt: u32,
    ) -> Result<(RunId, Result<()>)> {
        let run_id = self.ledger.create_run(commit_id, branch, attempt).await?;
        let cancel_rx = self.register_cancel(&run_id);
        self.bus.publish(EngineEvent::RunQueued {
            run_id: run_id.clone(),
            branch: branch.to_string(),
            commit_id: commit_id.to_string(),
            attempt,
        });

        let outcome = self
            .drive(&run_id, commit_id, instance_id, cancel_rx)
            .await;
        self.unregister_cancel(&run_id);

        match &outcome {
            Ok(()) => {
                METRICS.inc_runs_succeeded();
                self.bus.publish(EngineEvent::RunCompleted {
                    run_id: run_id.clone(),
                    success: true,
                });
                info!(run_id = %run_id, branch, "run succeeded");
            }
            Err(e) => {
                METRICS.inc_runs_failed();
                self.bus.publish(EngineEvent::RunCompleted {
                    run_id: run_id.clone(),
                    success: false,
                });
                warn!(run_id = %run_id, branch, error = %e, "run failed");
            }
        }
        Ok((run_id, outcome))
    }

    async fn drive(
        &self,
        run_id: &RunId,
        commit_id: &CommitId,
        instance_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        self.ledger.start_run(run_id).await?;
        METRICS.inc_runs_started();
        self.bus.publish(EngineEvent::RunStarted {
            run_id: run_id.clone(),
        });

        let mut seq = 1u64;
        for stage in Stage::ALL {
            if *cancel.borrow() {
                self.ledger
                    .fail_run(run_id, Some("cancelled by user".to_string()))
                    .await?;
                return Err(EngineError::CancelledByUser {
                    run_id: run_id.clone(),
                });
            }
            self.ledger.set_current_stage(run_id, stage.name()).await?;

            match stage {
                Stage::Build | Stage::Test => {
                    self.run_command_stage(run_id, stage, commit_id, &mut seq)
                        .await?
                }
                Stage::Deploy => {
                    self.run_deploy_stage(run_id, commit_id, instance_id, &mut seq)
                        .await?
                }
            }
        }

        self.ledger.complete_run(run_id).await?;
        Ok(())
    }

    async fn run_command_stage(
        &self,
        run_id: &RunId,
        stage: Stage,
        commit_id: &CommitId,
        seq: &mut u64,
    ) -> Result<()> {
        let deadline = Duration::from_millis(self.config.stage_timeout_ms);
        let started = Instant::now();

        match tokio::time::timeout(deadline, self.executor.execute(stage, commit_id)).await {
            Err(_) => {
                let detail = format!("timed out after {}ms", self.config.stage_timeout_ms);
                self.record_stage(run_id, seq, stage, StageOutcome::TimedOut, None, detail, deadline.as_millis() as u64)
                    .await?;
                self.ledger
                    .fail_run(run_id, Some(format!("stage {stage} timed out")))
                    .await?;
                Err(EngineError::StageTimeout {
                    stage: stage.name().to_string(),
                    timeout_ms: self.config.stage_timeout_ms,
                })
            }
            Ok(Err(e)) => {
                // Stage could not run at all (spawn failure)
                let detail = e.to_string();
                let elapsed = started.elapsed().as_millis() as u64;
                self.record_stage(run_id, seq, stage, StageOutcome::Failed, None, detail.clone(), elapsed)
                    .await?;
                self.ledger.fail_run(run_id, Some(detail.clone())).await?;
                Err(EngineError::StageFailed {
                    stage: stage.name().to_string(),
                    detail,
                })
            }
            Ok(Ok(out)) if out.success => {
                self.record_stage(
                    run_id,
                    seq,
                    stage,
                    StageOutcome::Succeeded,
                    Some(out.exit_code),
                    out.output,
                    out.duration_ms,
                )
                .await
            }
            Ok(Ok(out)) => {
                let detail = format!("stage {stage} exited with code {}", out.exit_code);
                self.record_stage(
                    run_id,
                    seq,
                    stage,
                    StageOutcome::Failed,
                    Some(out.exit_code),
                    out.output,
                    out.duration_ms,
                )
                .await?;
                self.ledger.fail_run(run_id, Some(detail.clone())).await?;
                Err(EngineError::StageFailed {
                    stage: stage.name().to_string(),
                    detail,
                })
            }
        }
    }

    async fn run_deploy_stage(
        &self,
        run_id: &RunId,
        commit_id: &CommitId,
        instance_id: &str,
        seq: &mut u64,
    ) -> Result<()> {
        let deadline = Duration::from_millis(self.config.stage_timeout_ms);
        let started = Instant::now();

        match tokio::time::timeout(deadline, self.manager.deploy(instance_id, commit_id)).await {
            Err(_) => {
                // The deploy future was dropped mid-flight: `desired` may
                // already point at the commit. Leave a failed history entry
                // and an unhealthy flag so the gap is visible.
                if let Err(e) = self.manager.abandon_deploy(instance_id, commit_id).await {
                    warn!(instance_id, error = %e, "could not record abandoned deploy");
                }
                let detail = format!("timed out after {}ms", self.config.stage_timeout_ms);
                self.record_stage(
                    run_id,
                    seq,
                    Stage::Deploy,
                    StageOutcome::TimedOut,
                    None,
                    detail,
                    deadline.as_millis() as u64,
                )
                .await?;
                self.ledger
                    .fail_run(run_id, Some("stage deploy timed out".to_string()))
                    .await?;
                Err(EngineError::StageTimeout {
                    stage: Stage::Deploy.name().to_string(),
                    timeout_ms: self.config.stage_timeout_ms,
                })
            }
            Ok(Ok(())) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.record_stage(
                    run_id,
                    seq,
                    Stage::Deploy,
                    StageOutcome::Succeeded,
                    None,
                    format!("deployed to {instance_id}"),
                    elapsed,
                )
                .await
            }
            Ok(Err(e)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.record_stage(
                    run_id,
                    seq,
                    Stage::Deploy,
                    StageOutcome::Failed,
                    None,
                    e.to_string(),
                    elapsed,
                )
                .await?;
                self.ledger.fail_run(run_id, Some(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// Append the stage result and publish `StageCompleted`.
    #[allow(clippy::too_many_arguments)]
    async fn record_stage(
        &self,
        run_id: &RunId,
        seq: &mut u64,
        stage: Stage,
        outcome: StageOutcome,
        exit_code: Option<i32>,
        detail: String,
        duration_ms: u64,
    ) -> Result<()> {
        self.ledger
            .append_stage_result(
                run_id,
                StageResult {
                    seq: *seq,
                    stage: stage.name().to_string(),
                    outcome,
                    exit_code,
                    detail,
                    duration_ms,
                },
            )
            .await?;
        *seq += 1;
        self.bus.publish(EngineEvent::StageCompleted {
            run_id: run_id.clone(),
            stage: stage.name().to_string(),
            outcome,
        });
        Ok(())
    }

    fn register_cancel(&self, run_id: &RunId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(run_id.0.clone(), tx);
        }
        rx
    }

    fn unregister_cancel(&self, run_id: &RunId) {
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(&run_id.0);
        }
    }
}

fn run_miss(e: StorageError) -> EngineError {
    match e {
        StorageError::RunNotFound { run_id } => EngineError::RunNotFound(RunId(run_id)),
        other => EngineError::Storage(other),
    }
}

/// Whether the pipeline failure happened at the deploy stage, which is
/// what decides automatic rollback after exhaustion.
fn is_deploy_failure(err: &EngineError) -> bool {
    match err {
        EngineError::DeploymentFailed { .. } => true,
        EngineError::StageTimeout { stage, .. } | EngineError::StageFailed { stage, .. } => {
            stage == Stage::Deploy.name()
        }
        _ => false,
    }
}
