//! SurrealDB schema migrations and initialization
//!
//! This module provides initialization functions to set up all tables
//! with proper constraints and indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Shipway tables in SurrealDB
///
/// This should be called once on first connection to set up the schema.
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Shipway SurrealDB schema");

    init_commits_table(db).await?;
    init_branches_table(db).await?;
    init_runs_table(db).await?;
    init_stage_results_table(db).await?;
    init_instances_table(db).await?;
    init_deployments_table(db).await?;

    info!("Shipway schema initialization complete");
    Ok(())
}

/// Initialize `commits` table with constraints and indexes
///
/// Constraints:
/// - `commit_id` is unique (content-addressed, one row per hash)
/// - Rows are immutable: updates and deletes are denied at the table level
async fn init_commits_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing commits table");

    let sql = r#"
        DEFINE TABLE commits
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        -- Content-addressed: one row per commit hash
        DEFINE INDEX idx_commit_id ON TABLE commits COLUMNS commit_id UNIQUE;

        -- Index created_at for the monotonic timestamp issuer re-seed
        DEFINE INDEX idx_created_at ON TABLE commits COLUMNS created_at;

        -- Index author for audit queries
        DEFINE INDEX idx_author ON TABLE commits COLUMNS author;
    "#;

    db.query(sql).await?;
    info!("✓ commits table initialized");
    Ok(())
}

/// Initialize `branches` table with constraints and indexes
async fn init_branches_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing branches table");

    let sql = r#"
        DEFINE TABLE branches
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX idx_branch_name ON TABLE branches COLUMNS name UNIQUE;
        DEFINE INDEX idx_branch_head ON TABLE branches COLUMNS head;
    "#;

    db.query(sql).await?;
    info!("✓ branches table initialized");
    Ok(())
}

/// Initialize `runs` table with constraints and indexes
///
/// Constraints:
/// - `run_id` is unique (prevents duplicate runs)
/// - `status` transitions pending → running → succeeded | failed and
///   failed → rolled_back are enforced via app logic
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE runs
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        -- Ensure run_id is unique
        DEFINE INDEX idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;

        -- Index branch for per-branch run listings
        DEFINE INDEX idx_run_branch ON TABLE runs COLUMNS branch;

        -- Index commit_id for correlating runs with commits
        DEFINE INDEX idx_run_commit ON TABLE runs COLUMNS commit_id;

        -- Composite index (branch, created_at DESC) for fast branch history
        DEFINE INDEX idx_run_branch_created_at ON TABLE runs COLUMNS branch, created_at;

        -- Composite index (run_id, status) for state queries
        DEFINE INDEX idx_run_id_status ON TABLE runs COLUMNS run_id, status;
    "#;

    db.query(sql).await?;
    info!("✓ runs table initialized");
    Ok(())
}

/// Initialize `stage_results` table with constraints and indexes
///
/// Constraints:
/// - `(run_id, seq)` is unique, the critical constraint for stage ordering
/// - Rows are append-only: updates and deletes are denied
async fn init_stage_results_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing stage_results table");

    let sql = r#"
        DEFINE TABLE stage_results
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        -- Composite unique index: (run_id, seq) ensures no duplicate sequences per run
        DEFINE INDEX idx_stage_run_id_seq ON TABLE stage_results COLUMNS run_id, seq UNIQUE;

        -- Index run_id for fast retrieval by run
        DEFINE INDEX idx_stage_run_id ON TABLE stage_results COLUMNS run_id;

        -- Index stage name for filtering
        DEFINE INDEX idx_stage_name ON TABLE stage_results COLUMNS stage;
    "#;

    db.query(sql).await?;
    info!("✓ stage_results table initialized");
    Ok(())
}

/// Initialize `instances` table with constraints and indexes
async fn init_instances_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing instances table");

    let sql = r#"
        DEFINE TABLE instances
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_instance_id ON TABLE instances COLUMNS instance_id UNIQUE;
        DEFINE INDEX idx_instance_project ON TABLE instances COLUMNS project_id;
    "#;

    db.query(sql).await?;
    info!("✓ instances table initialized");
    Ok(())
}

/// Initialize `deployments` table with constraints and indexes
///
/// Constraints:
/// - `(instance_id, seq)` is unique
/// - History is append-only: rollback appends a new entry, nothing is
///   rewritten (updates and deletes denied)
async fn init_deployments_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing deployments table");

    let sql = r#"
        DEFINE TABLE deployments
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_deploy_instance_seq ON TABLE deployments COLUMNS instance_id, seq UNIQUE;
        DEFINE INDEX idx_deploy_instance ON TABLE deployments COLUMNS instance_id;
        DEFINE INDEX idx_deploy_commit ON TABLE deployments COLUMNS commit_id;
    "#;

    db.query(sql).await?;
    info!("✓ deployments table initialized");
    Ok(())
}
