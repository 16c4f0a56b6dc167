//! SurrealDB Store - Connection and CommitGraph Operations
//!
//! Manages the connection and implements the [`CommitGraph`] trait over
//! the `commits` and `branches` tables. The [`RunLedger`] and
//! [`InstanceRegistry`] implementations live in sibling modules and share
//! the same handle.
//!
//! Supports the embedded in-memory engine (`mem://`) for tests and the
//! log-structured SurrealKV engine (`surrealkv://<path>`) for durable use.
//!
//! [`RunLedger`]: crate::storage_traits::RunLedger
//! [`InstanceRegistry`]: crate::storage_traits::InstanceRegistry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{BranchRecord, CommitId, CommitRecord};
use crate::storage_traits::{Branch, Commit, CommitGraph, StorageResult};
use crate::Result;

/// SurrealDB connection handle for Shipway
#[derive(Clone)]
pub struct SurrealStore {
    pub(crate) db: Surreal<Any>,
}

impl SurrealStore {
    /// Connect to SurrealDB in-memory and set up schema
    #[instrument(skip_all)]
    pub async fn in_memory() -> Result<Self> {
        info!("Connecting to SurrealDB (in-memory)");
        Self::connect("mem://").await
    }

    /// Connect to the given SurrealDB URL and set up schema.
    ///
    /// Accepts `mem://` for ephemeral stores and `surrealkv://<path>` for
    /// the durable log-structured engine.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns("shipway")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB connected and schema initialized");
        Ok(SurrealStore { db })
    }

    /// Connect using the `SHIPWAY_DB` environment variable.
    ///
    /// Falls back to in-memory when the variable is not set.
    #[instrument(skip_all)]
    pub async fn from_env() -> Result<Self> {
        match std::env::var("SHIPWAY_DB") {
            Ok(url) => {
                info!("SHIPWAY_DB found, connecting to {url}");
                Self::connect(&url).await
            }
            Err(_) => {
                info!("No SHIPWAY_DB set, using in-memory database");
                Self::in_memory().await
            }
        }
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a commit row by hash.
    pub(crate) async fn fetch_commit(&self, hash: &str) -> StorageResult<Option<CommitRecord>> {
        let hash_owned = hash.to_string();
        let mut result = self
            .db
            .query("SELECT * FROM commits WHERE commit_id = $hash")
            .bind(("hash", hash_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<CommitRecord> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    /// Fetch a branch row by name.
    pub(crate) async fn fetch_branch(&self, name: &str) -> StorageResult<Option<BranchRecord>> {
        let name_owned = name.to_string();
        let mut result = self
            .db
            .query("SELECT * FROM branches WHERE name = $name")
            .bind(("name", name_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BranchRecord> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    /// Convert a DB commit row into the domain `Commit`.
    pub(crate) fn row_to_commit(row: CommitRecord) -> StorageResult<Commit> {
        let parents = row
            .parents
            .into_iter()
            .map(CommitId::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Commit {
            id: CommitId::try_from(row.commit_id)?,
            parents,
            author: row.author,
            message: row.message,
            timestamp: row.created_at,
        })
    }

    /// Convert a DB branch row into the domain `Branch`.
    fn row_to_branch(row: BranchRecord) -> StorageResult<Branch> {
        Ok(Branch {
            name: row.name,
            head: CommitId::try_from(row.head)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl CommitGraph for SurrealStore {
    #[instrument(skip(self, commit), fields(commit_id = %commit.id.short()))]
    async fn put_commit(&self, commit: &Commit) -> StorageResult<Commit> {
        // Content-addressed: an existing row wins, the new write is a no-op.
        if let Some(existing) = self.fetch_commit(commit.id.as_str()).await? {
            debug!("commit already stored, returning existing row");
            return Self::row_to_commit(existing);
        }

        let record = CommitRecord::new(
            &commit.id,
            &commit.parents,
            &commit.author,
            &commit.message,
            commit.timestamp,
        );

        let created: Option<CommitRecord> = self
            .db
            .create("commits")
            .content(record)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        created
            .map(Self::row_to_commit)
            .transpose()?
            .ok_or_else(|| StorageError::Backend("failed to create commit".to_string()))
    }

    async fn get_commit(&self, id: &CommitId) -> StorageResult<Option<Commit>> {
        self.fetch_commit(id.as_str())
            .await?
            .map(Self::row_to_commit)
            .transpose()
    }

    async fn contains_commit(&self, id: &CommitId) -> StorageResult<bool> {
        Ok(self.fetch_commit(id.as_str()).await?.is_some())
    }

    async fn latest_timestamp(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let mut result = self
            .db
            .query("SELECT * FROM commits ORDER BY created_at DESC LIMIT 1")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<CommitRecord> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next().map(|r| r.created_at))
    }

    #[instrument(skip(self, head), fields(branch = %name, head = %head.short()))]
    async fn create_branch(&self, name: &str, head: &CommitId) -> StorageResult<Branch> {
        if self.fetch_branch(name).await?.is_some() {
            return Err(StorageError::BranchExists {
                name: name.to_string(),
            });
        }

        let record = BranchRecord::new(name, head.as_str());
        let created: Option<BranchRecord> = self
            .db
            .create("branches")
            .content(record)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        created
            .map(Self::row_to_branch)
            .transpose()?
            .ok_or_else(|| StorageError::Backend("failed to create branch".to_string()))
    }

    #[instrument(skip(self, head), fields(branch = %name, head = %head.short()))]
    async fn set_branch_head(&self, name: &str, head: &CommitId) -> StorageResult<Branch> {
        if self.fetch_branch(name).await?.is_none() {
            return Err(StorageError::BranchNotFound {
                name: name.to_string(),
            });
        }

        let head_owned = head.as_str().to_string();
        let now = surrealdb::sql::Datetime::from(Utc::now());
        let name_owned = name.to_string();

        let mut result = self
            .db
            .query("UPDATE branches SET head = $head, updated_at = $now WHERE name = $name")
            .bind(("head", head_owned))
            .bind(("now", now))
            .bind(("name", name_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let updated: Vec<BranchRecord> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        updated
            .into_iter()
            .next()
            .map(Self::row_to_branch)
            .transpose()?
            .ok_or_else(|| StorageError::Backend("failed to update branch".to_string()))
    }

    async fn get_branch(&self, name: &str) -> StorageResult<Option<Branch>> {
        self.fetch_branch(name)
            .await?
            .map(Self::row_to_branch)
            .transpose()
    }

    async fn list_branches(&self) -> StorageResult<Vec<Branch>> {
        let mut result = self
            .db
            .query("SELECT * FROM branches ORDER BY name")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BranchRecord> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(Self::row_to_branch).collect()
    }

    #[instrument(skip(self), fields(branch = %name))]
    async fn delete_branch(&self, name: &str) -> StorageResult<()> {
        let name_owned = name.to_string();
        let mut result = self
            .db
            .query("DELETE FROM branches WHERE name = $name RETURN BEFORE")
            .bind(("name", name_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let deleted: Vec<BranchRecord> = result
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if deleted.is_empty() {
            return Err(StorageError::BranchNotFound {
                name: name.to_string(),
            });
        }

        Ok(())
    }
}
