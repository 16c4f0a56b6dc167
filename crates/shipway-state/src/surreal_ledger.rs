//! SurrealDB-backed RunLedger implementation
//!
//! Uses `schema::RunRecord` and `schema::StageResultRecord` for
//! persistence, converting to/from `storage_traits` types at the boundary.

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::handle::SurrealStore;
use crate::schema::{CommitId, RunRecord as DbRun, StageResultRecord as DbStage};
use crate::storage_traits::{
    PipelineRun, RunId, RunLedger, RunStatus, StageOutcome, StageResult, StorageResult,
};

impl SurrealStore {
    // -- private helpers -----------------------------------------------------

    /// Fetch a run row by ID, returning the DB row or RunNotFound.
    async fn fetch_run(&self, rid: &str) -> StorageResult<DbRun> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<DbRun> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    /// Fetch a run row and verify its status matches `expected`.
    async fn fetch_with_status(&self, rid: &str, expected: &str) -> StorageResult<DbRun> {
        let row = self.fetch_run(rid).await?;
        if row.status != expected {
            return Err(StorageError::InvalidRunState {
                run_id: rid.to_string(),
                status: row.status,
                expected: expected.to_string(),
            });
        }
        Ok(row)
    }

    /// Overwrite a run row keyed by run_id.
    async fn replace_run(&self, row: DbRun) -> StorageResult<()> {
        let rid_owned = row.run_id.clone();
        self.db
            .query("UPDATE runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Insert a stage result row.
    async fn insert_stage(&self, row: DbStage) -> StorageResult<()> {
        let _created: Option<DbStage> = self
            .db
            .create("stage_results")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Convert a DB run row into a `storage_traits::PipelineRun`.
    fn db_run_to_record(row: DbRun) -> StorageResult<PipelineRun> {
        let status = match row.status.as_str() {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            "rolled_back" => RunStatus::RolledBack,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown run status: {other}"
                )))
            }
        };

        Ok(PipelineRun {
            run_id: RunId(row.run_id),
            commit_id: CommitId::try_from(row.commit_id)?,
            branch: row.branch,
            attempt: row.attempt,
            status,
            current_stage: row.current_stage,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }

    /// Convert a DB stage row into a `storage_traits::StageResult`.
    fn db_stage_to_result(row: DbStage) -> StorageResult<StageResult> {
        let outcome = match row.outcome.as_str() {
            "succeeded" => StageOutcome::Succeeded,
            "failed" => StageOutcome::Failed,
            "timed_out" => StageOutcome::TimedOut,
            "rolled_back" => StageOutcome::RolledBack,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown stage outcome: {other}"
                )))
            }
        };
        Ok(StageResult {
            seq: row.seq,
            stage: row.stage,
            outcome,
            exit_code: row.exit_code,
            detail: row.detail,
            duration_ms: row.duration_ms,
        })
    }

    fn result_to_db_stage(run_id: &RunId, result: StageResult) -> DbStage {
        DbStage::new(
            run_id.0.clone(),
            result.seq,
            result.stage,
            result.outcome.to_string(),
            result.exit_code,
            result.detail,
            result.duration_ms,
        )
    }
}

#[async_trait]
impl RunLedger for SurrealStore {
    async fn create_run(
        &self,
        commit_id: &CommitId,
        branch: &str,
        attempt: u32,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let db_row = DbRun::new(
            run_id.0.clone(),
            commit_id.as_str().to_string(),
            branch.to_string(),
            attempt,
        );

        debug!(run_id = %run_id, branch = %branch, attempt, "creating run");

        let _created: Option<DbRun> = self
            .db
            .create("runs")
            .content(db_row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(run_id)
    }

    async fn start_run(&self, run_id: &RunId) -> StorageResult<()> {
        let row = self.fetch_with_status(&run_id.0, "pending").await?;
        self.replace_run(row.start()).await
    }

    async fn set_current_stage(&self, run_id: &RunId, stage: &str) -> StorageResult<()> {
        let mut row = self.fetch_with_status(&run_id.0, "running").await?;
        row.current_stage = Some(stage.to_string());
        self.replace_run(row).await
    }

    async fn append_stage_result(&self, run_id: &RunId, result: StageResult) -> StorageResult<()> {
        self.fetch_with_status(&run_id.0, "running").await?;
        self.insert_stage(Self::result_to_db_stage(run_id, result))
            .await
    }

    async fn complete_run(&self, run_id: &RunId) -> StorageResult<()> {
        let row = self.fetch_with_status(&run_id.0, "running").await?;
        self.replace_run(row.succeed()).await
    }

    async fn fail_run(&self, run_id: &RunId, reason: Option<String>) -> StorageResult<()> {
        let row = self.fetch_with_status(&run_id.0, "running").await?;
        self.replace_run(row.fail(reason)).await
    }

    async fn roll_back_run(&self, run_id: &RunId, compensation: StageResult) -> StorageResult<()> {
        let row = self.fetch_with_status(&run_id.0, "failed").await?;
        self.insert_stage(Self::result_to_db_stage(run_id, compensation))
            .await?;
        self.replace_run(row.roll_back()).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRun> {
        let row = self.fetch_run(&run_id.0).await?;
        Self::db_run_to_record(row)
    }

    async fn get_stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResult>> {
        // Verify run exists
        self.fetch_run(&run_id.0).await?;

        let rid_owned = run_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM stage_results WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<DbStage> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(Self::db_stage_to_result).collect()
    }

    async fn list_runs(&self, branch: Option<&str>) -> StorageResult<Vec<PipelineRun>> {
        let rows: Vec<DbRun> = if let Some(branch) = branch {
            let branch_owned = branch.to_string();
            let mut res = self
                .db
                .query("SELECT * FROM runs WHERE branch = $branch ORDER BY created_at DESC")
                .bind(("branch", branch_owned))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(Self::db_run_to_record).collect()
    }
}
