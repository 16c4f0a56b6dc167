//! Instance Manager — deployable project instances.
//!
//! An instance tracks what commit is running (`deployed`), what should be
//! running (`desired`), and a health flag, plus an append-only deployment
//! history. The actual deployment action is externally delegated through
//! the injected [`Deployer`] trait; this module owns the bookkeeping and
//! the at-most-one-in-flight guarantee per instance.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use shipway_state::storage_traits::{
    CommitGraph, DeploymentEntry, DeploymentKind, Instance, InstanceRegistry,
};
use shipway_state::{CommitId, StorageError};

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::METRICS;

/// Externally delegated deployment action.
///
/// Implementations push the commit's artifact to wherever the instance
/// actually runs. Errors are surfaced to the pipeline so it can retry
/// and ultimately roll back.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, instance: &Instance, commit_id: &CommitId) -> anyhow::Result<()>;
}

/// Deployer that performs no external action. Used by tests and by
/// setups where deployment is tracked but delegated out-of-band.
pub struct NoopDeployer;

#[async_trait]
impl Deployer for NoopDeployer {
    async fn deploy(&self, instance: &Instance, commit_id: &CommitId) -> anyhow::Result<()> {
        info!(
            instance_id = %instance.instance_id,
            commit_id = commit_id.short(),
            "noop deploy"
        );
        Ok(())
    }
}

/// Removes the instance id from the in-flight set when dropped, so the
/// guard releases on every exit path.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    instance_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.instance_id);
        }
    }
}

/// Manages deployable instances over an [`InstanceRegistry`] backend.
pub struct InstanceManager<R: InstanceRegistry, G: CommitGraph> {
    registry: Arc<R>,
    graph: Arc<G>,
    bus: EventBus,
    deployer: Arc<dyn Deployer>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl<R: InstanceRegistry, G: CommitGraph> InstanceManager<R, G> {
    pub fn new(registry: Arc<R>, graph: Arc<G>, bus: EventBus, deployer: Arc<dyn Deployer>) -> Self {
        Self {
            registry,
            graph,
            bus,
            deployer,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register a new instance for a project.
    pub async fn register(&self, project_id: &str) -> Result<Instance> {
        let instance = self.registry.register(project_id).await?;
        info!(
            instance_id = %instance.instance_id,
            project_id,
            "instance registered"
        );
        Ok(instance)
    }

    /// Retrieve an instance, failing with `InstanceNotFound` if absent.
    pub async fn get(&self, instance_id: &str) -> Result<Instance> {
        self.registry.get(instance_id).await.map_err(instance_miss)
    }

    /// List all instances.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.registry.list().await?)
    }

    /// Full append-only deployment history for an instance.
    pub async fn history(&self, instance_id: &str) -> Result<Vec<DeploymentEntry>> {
        self.registry
            .deployments(instance_id)
            .await
            .map_err(instance_miss)
    }

    /// Deploy a commit to an instance.
    ///
    /// At most one deployment per instance may be in flight; a concurrent
    /// second call fails immediately with `AlreadyDeploying`. On success
    /// the instance records the commit as deployed and healthy; on failure
    /// health goes `Unhealthy`, `deployed` is left pointing at what is
    /// actually still running, and the error propagates so the pipeline
    /// can retry or roll back.
    #[instrument(skip(self))]
    pub async fn deploy(&self, instance_id: &str, commit_id: &CommitId) -> Result<()> {
        if !self.graph.contains_commit(commit_id).await? {
            return Err(EngineError::UnknownCommit(commit_id.to_string()));
        }
        let instance = self.get(instance_id).await?;
        let _guard = self.acquire_in_flight(instance_id)?;

        self.registry.set_desired(instance_id, commit_id).await?;
        let outcome = self.deployer.deploy(&instance, commit_id).await;
        self.record_outcome(instance_id, commit_id, DeploymentKind::Deploy, outcome)
            .await
    }

    /// Roll an instance back to its prior successful deployment.
    ///
    /// The target is the most recent successful history entry for a
    /// different commit than the current desired one. The rollback
    /// redeploys that commit and appends a compensating `Rollback` entry;
    /// history is never rewritten.
    #[instrument(skip(self))]
    pub async fn rollback(&self, instance_id: &str) -> Result<CommitId> {
        let instance = self.get(instance_id).await?;
        let target = self.rollback_target(&instance).await?;
        let _guard = self.acquire_in_flight(instance_id)?;

        self.registry.set_desired(instance_id, &target).await?;
        let outcome = self.deployer.deploy(&instance, &target).await;
        self.record_outcome(instance_id, &target, DeploymentKind::Rollback, outcome)
            .await?;
        Ok(target)
    }

    fn acquire_in_flight(&self, instance_id: &str) -> Result<InFlightGuard> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| EngineError::AlreadyDeploying(instance_id.to_string()))?;
        if !set.insert(instance_id.to_string()) {
            return Err(EngineError::AlreadyDeploying(instance_id.to_string()));
        }
        Ok(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            instance_id: instance_id.to_string(),
        })
    }

    async fn record_outcome(
        &self,
        instance_id: &str,
        commit_id: &CommitId,
        kind: DeploymentKind,
        outcome: anyhow::Result<()>,
    ) -> Result<()> {
        let seq = self.registry.deployments(instance_id).await?.len() as u64 + 1;
        let success = outcome.is_ok();
        self.registry
            .append_deployment(
                instance_id,
                DeploymentEntry {
                    seq,
                    commit_id: commit_id.clone(),
                    kind,
                    success,
                    recorded_at: Utc::now(),
                },
            )
            .await?;

        match outcome {
            Ok(()) => {
                self.registry.mark_deployed(instance_id, commit_id).await?;
                match kind {
                    DeploymentKind::Deploy => {
                        METRICS.inc_deploys();
                        self.bus.publish(EngineEvent::InstanceDeployed {
                            instance_id: instance_id.to_string(),
                            commit_id: commit_id.to_string(),
                        });
                    }
                    DeploymentKind::Rollback => {
                        METRICS.inc_rollbacks();
                        self.bus.publish(EngineEvent::InstanceRolledBack {
                            instance_id: instance_id.to_string(),
                            commit_id: commit_id.to_string(),
                        });
                    }
                }
                info!(instance_id, commit_id = commit_id.short(), ?kind, "deployment succeeded");
                Ok(())
            }
            Err(e) => {
                self.registry.mark_unhealthy(instance_id).await?;
                warn!(instance_id, commit_id = commit_id.short(), error = %e, "deployment failed");
                Err(EngineError::DeploymentFailed {
                    instance_id: instance_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Record a deployment attempt that was abandoned mid-flight (the
    /// caller dropped the deploy future, e.g. on a stage deadline).
    ///
    /// Appends a failed history entry and marks the instance unhealthy:
    /// `desired` may already point at the abandoned commit, which is
    /// provably not what is running.
    #[instrument(skip(self))]
    pub async fn abandon_deploy(&self, instance_id: &str, commit_id: &CommitId) -> Result<()> {
        let seq = self.history(instance_id).await?.len() as u64 + 1;
        self.registry
            .append_deployment(
                instance_id,
                DeploymentEntry {
                    seq,
                    commit_id: commit_id.clone(),
                    kind: DeploymentKind::Deploy,
                    success: false,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        self.registry.mark_unhealthy(instance_id).await?;
        warn!(
            instance_id,
            commit_id = commit_id.short(),
            "deploy abandoned before completion"
        );
        Ok(())
    }

    /// Most recent successful history entry for a commit other than the
    /// instance's current desired one.
    async fn rollback_target(&self, instance: &Instance) -> Result<CommitId> {
        let reference = instance.desired.as_ref().or(instance.deployed.as_ref());
        let history = self.registry.deployments(&instance.instance_id).await?;
        history
            .iter()
            .rev()
            .find(|e| e.success && Some(&e.commit_id) != reference)
            .map(|e| e.commit_id.clone())
            .ok_or_else(|| EngineError::NoPriorDeployment(instance.instance_id.clone()))
    }
}

fn instance_miss(e: StorageError) -> EngineError {
    match e {
        StorageError::InstanceNotFound { instance_id } => EngineError::InstanceNotFound(instance_id),
        other => EngineError::Storage(other),
    }
}
