//! SurrealDB-backed InstanceRegistry implementation
//!
//! Uses `schema::InstanceRecord` and `schema::DeploymentRecord` for
//! persistence, converting to/from `storage_traits` types at the boundary.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::StorageError;
use crate::handle::SurrealStore;
use crate::schema::{CommitId, DeploymentRecord as DbDeployment, InstanceRecord as DbInstance};
use crate::storage_traits::{
    DeploymentEntry, DeploymentKind, HealthStatus, Instance, InstanceRegistry, StorageResult,
};

impl SurrealStore {
    // -- private helpers -----------------------------------------------------

    /// Fetch an instance row, returning the DB row or InstanceNotFound.
    async fn fetch_instance(&self, iid: &str) -> StorageResult<DbInstance> {
        let iid_owned = iid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM instances WHERE instance_id = $iid")
            .bind(("iid", iid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<DbInstance> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::InstanceNotFound {
                instance_id: iid.to_string(),
            })
    }

    /// Overwrite an instance row keyed by instance_id.
    async fn replace_instance(&self, mut row: DbInstance) -> StorageResult<()> {
        row.updated_at = Utc::now();
        let iid_owned = row.instance_id.clone();
        self.db
            .query("UPDATE instances CONTENT $row WHERE instance_id = $iid")
            .bind(("row", row))
            .bind(("iid", iid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Convert a DB instance row into a `storage_traits::Instance`.
    fn db_instance_to_record(row: DbInstance) -> StorageResult<Instance> {
        let health = match row.health.as_str() {
            "unknown" => HealthStatus::Unknown,
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown health status: {other}"
                )))
            }
        };
        Ok(Instance {
            instance_id: row.instance_id,
            project_id: row.project_id,
            deployed: row.deployed.map(CommitId::try_from).transpose()?,
            desired: row.desired.map(CommitId::try_from).transpose()?,
            health,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// Convert a DB deployment row into a `storage_traits::DeploymentEntry`.
    fn db_deployment_to_entry(row: DbDeployment) -> StorageResult<DeploymentEntry> {
        let kind = match row.kind.as_str() {
            "deploy" => DeploymentKind::Deploy,
            "rollback" => DeploymentKind::Rollback,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown deployment kind: {other}"
                )))
            }
        };
        Ok(DeploymentEntry {
            seq: row.seq,
            commit_id: CommitId::try_from(row.commit_id)?,
            kind,
            success: row.success,
            recorded_at: row.recorded_at,
        })
    }
}

#[async_trait]
impl InstanceRegistry for SurrealStore {
    async fn register(&self, project_id: &str) -> StorageResult<Instance> {
        let row = DbInstance::new(uuid::Uuid::new_v4().to_string(), project_id);

        debug!(instance_id = %row.instance_id, project = %project_id, "registering instance");

        let created: Option<DbInstance> = self
            .db
            .create("instances")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        created
            .map(Self::db_instance_to_record)
            .transpose()?
            .ok_or_else(|| StorageError::Backend("failed to create instance".to_string()))
    }

    async fn get(&self, instance_id: &str) -> StorageResult<Instance> {
        let row = self.fetch_instance(instance_id).await?;
        Self::db_instance_to_record(row)
    }

    async fn list(&self) -> StorageResult<Vec<Instance>> {
        let mut res = self
            .db
            .query("SELECT * FROM instances ORDER BY instance_id")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<DbInstance> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(Self::db_instance_to_record).collect()
    }

    async fn set_desired(&self, instance_id: &str, commit_id: &CommitId) -> StorageResult<()> {
        let mut row = self.fetch_instance(instance_id).await?;
        row.desired = Some(commit_id.as_str().to_string());
        self.replace_instance(row).await
    }

    async fn mark_deployed(&self, instance_id: &str, commit_id: &CommitId) -> StorageResult<()> {
        let mut row = self.fetch_instance(instance_id).await?;
        row.deployed = Some(commit_id.as_str().to_string());
        row.health = "healthy".to_string();
        self.replace_instance(row).await
    }

    async fn mark_unhealthy(&self, instance_id: &str) -> StorageResult<()> {
        let mut row = self.fetch_instance(instance_id).await?;
        row.health = "unhealthy".to_string();
        self.replace_instance(row).await
    }

    async fn append_deployment(
        &self,
        instance_id: &str,
        entry: DeploymentEntry,
    ) -> StorageResult<()> {
        // Verify instance exists
        self.fetch_instance(instance_id).await?;

        let row = DbDeployment {
            id: None,
            instance_id: instance_id.to_string(),
            seq: entry.seq,
            commit_id: entry.commit_id.as_str().to_string(),
            kind: match entry.kind {
                DeploymentKind::Deploy => "deploy".to_string(),
                DeploymentKind::Rollback => "rollback".to_string(),
            },
            success: entry.success,
            recorded_at: entry.recorded_at,
        };

        let _created: Option<DbDeployment> = self
            .db
            .create("deployments")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn deployments(&self, instance_id: &str) -> StorageResult<Vec<DeploymentEntry>> {
        // Verify instance exists
        self.fetch_instance(instance_id).await?;

        let iid_owned = instance_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM deployments WHERE instance_id = $iid ORDER BY seq ASC")
            .bind(("iid", iid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<DbDeployment> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(Self::db_deployment_to_entry).collect()
    }
}
