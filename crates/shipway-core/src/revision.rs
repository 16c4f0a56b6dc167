//! Revision Store — the commit DAG and branch pointer layer.
//!
//! Commits are immutable, content-addressed nodes; branches are mutable
//! named pointers. The store assigns every commit a strictly monotonic
//! timestamp greater than all of its parents' timestamps, which makes
//! `(timestamp, id)` a total order consistent with the DAG and lets
//! [`HistoryWalk`] traverse newest-first with a plain max-heap.
//!
//! Branch updates are serialized per branch through keyed async locks;
//! commit reads are lock-free (immutable records).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use shipway_state::storage_traits::{Branch, Commit, CommitGraph};
use shipway_state::{CommitId, StorageError};

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::METRICS;

/// Author and message for a new commit.
#[derive(Debug, Clone)]
pub struct CommitMeta {
    pub author: String,
    pub message: String,
}

/// How a branch pointer update is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// The new head must be a descendant of (or equal to) the current head.
    FastForward,
    /// Move the pointer unconditionally.
    Force,
}

/// Commit DAG and branch pointers over a [`CommitGraph`] backend.
pub struct RevisionStore<G: CommitGraph> {
    graph: Arc<G>,
    bus: EventBus,
    /// Last issued commit timestamp; guards monotonicity across tasks.
    clock: Mutex<DateTime<Utc>>,
    /// Per-branch writer locks, created on first touch.
    branch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<G: CommitGraph> RevisionStore<G> {
    /// Open a revision store, re-seeding the timestamp issuer from the
    /// greatest timestamp already persisted.
    pub async fn open(graph: Arc<G>, bus: EventBus) -> Result<Self> {
        let seed = graph
            .latest_timestamp()
            .await?
            .unwrap_or_else(|| Utc::now() - Duration::seconds(1));
        debug!(seed = %seed, "revision store timestamp issuer seeded");

        Ok(Self {
            graph,
            bus,
            clock: Mutex::new(seed),
            branch_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying commit graph.
    pub fn graph(&self) -> &Arc<G> {
        &self.graph
    }

    /// Issue a timestamp strictly greater than the last issued one and
    /// strictly greater than `floor` (the max parent timestamp).
    async fn issue_timestamp(&self, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let mut last = self.clock.lock().await;
        let mut candidate = Utc::now();
        let min = *last + Duration::nanoseconds(1);
        if candidate < min {
            candidate = min;
        }
        if let Some(floor) = floor {
            let min = floor + Duration::nanoseconds(1);
            if candidate < min {
                candidate = min;
            }
        }
        *last = candidate;
        candidate
    }

    /// Add a commit with the given parents.
    ///
    /// Every parent must already exist. The id is a content hash over
    /// parents, author, and message; re-adding an existing id returns the
    /// stored commit unchanged.
    #[instrument(skip(self, meta), fields(author = %meta.author))]
    pub async fn add_commit(&self, parents: &[CommitId], meta: CommitMeta) -> Result<Commit> {
        let mut max_parent_ts = None;
        for parent in parents {
            match self.graph.get_commit(parent).await? {
                Some(p) => {
                    if max_parent_ts.map_or(true, |ts| p.timestamp > ts) {
                        max_parent_ts = Some(p.timestamp);
                    }
                }
                None => return Err(EngineError::InvalidParent(parent.to_string())),
            }
        }

        let id = CommitId::compute(parents, &meta.author, &meta.message);
        if let Some(existing) = self.graph.get_commit(&id).await? {
            debug!(commit_id = existing.id.short(), "commit already stored");
            return Ok(existing);
        }

        let commit = Commit {
            id: id.clone(),
            parents: parents.to_vec(),
            author: meta.author,
            message: meta.message,
            timestamp: self.issue_timestamp(max_parent_ts).await,
        };
        let stored = self.graph.put_commit(&commit).await?;

        METRICS.inc_commits_added();
        self.bus.publish(EngineEvent::CommitAdded {
            commit_id: stored.id.to_string(),
            author: stored.author.clone(),
        });
        info!(commit_id = stored.id.short(), parents = parents.len(), "commit added");
        Ok(stored)
    }

    /// Retrieve a commit, failing with `UnknownCommit` if absent.
    pub async fn get_commit(&self, id: &CommitId) -> Result<Commit> {
        self.graph
            .get_commit(id)
            .await?
            .ok_or_else(|| EngineError::UnknownCommit(id.to_string()))
    }

    /// Create a branch pointing at an existing commit.
    #[instrument(skip(self))]
    pub async fn create_branch(&self, name: &str, head: &CommitId) -> Result<Branch> {
        if !self.graph.contains_commit(head).await? {
            return Err(EngineError::UnknownCommit(head.to_string()));
        }
        let branch = self.graph.create_branch(name, head).await.map_err(|e| match e {
            StorageError::BranchExists { name } => EngineError::BranchExists(name),
            other => EngineError::Storage(other),
        })?;

        self.bus.publish(EngineEvent::BranchCreated {
            name: branch.name.clone(),
            head: branch.head.to_string(),
        });
        info!(branch = %branch.name, head = branch.head.short(), "branch created");
        Ok(branch)
    }

    /// Move a branch pointer.
    ///
    /// `FastForward` requires `new_head` to be a descendant of (or equal
    /// to) the current head, verified by walking parent links from
    /// `new_head`. Updates to the same branch are serialized; distinct
    /// branches proceed concurrently.
    #[instrument(skip(self))]
    pub async fn update_branch(
        &self,
        name: &str,
        new_head: &CommitId,
        mode: UpdateMode,
    ) -> Result<Branch> {
        let lock = self.branch_lock(name).await;
        let _guard = lock.lock().await;

        if !self.graph.contains_commit(new_head).await? {
            return Err(EngineError::UnknownCommit(new_head.to_string()));
        }
        let current = self
            .graph
            .get_branch(name)
            .await?
            .ok_or_else(|| EngineError::BranchNotFound(name.to_string()))?;

        if mode == UpdateMode::FastForward
            && !self.is_descendant(new_head, &current.head).await?
        {
            return Err(EngineError::NonFastForward {
                branch: name.to_string(),
                old_head: current.head.to_string(),
                new_head: new_head.to_string(),
            });
        }

        let updated = self.graph.set_branch_head(name, new_head).await?;

        METRICS.inc_branch_updates();
        self.bus.publish(EngineEvent::BranchUpdated {
            name: updated.name.clone(),
            old_head: current.head.to_string(),
            new_head: updated.head.to_string(),
            forced: mode == UpdateMode::Force,
        });
        info!(
            branch = %updated.name,
            old_head = current.head.short(),
            new_head = updated.head.short(),
            forced = mode == UpdateMode::Force,
            "branch updated"
        );
        Ok(updated)
    }

    /// Retrieve a branch, failing with `BranchNotFound` if absent.
    pub async fn get_branch(&self, name: &str) -> Result<Branch> {
        self.graph
            .get_branch(name)
            .await?
            .ok_or_else(|| EngineError::BranchNotFound(name.to_string()))
    }

    /// List all branches, ordered by name.
    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        Ok(self.graph.list_branches().await?)
    }

    /// Delete a branch pointer; commits are never deleted.
    #[instrument(skip(self))]
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.graph.delete_branch(name).await.map_err(|e| match e {
            StorageError::BranchNotFound { name } => EngineError::BranchNotFound(name),
            other => EngineError::Storage(other),
        })?;
        self.bus.publish(EngineEvent::BranchDeleted {
            name: name.to_string(),
        });
        info!(branch = name, "branch deleted");
        Ok(())
    }

    /// Start a lazy newest-first walk over a branch's history.
    ///
    /// The walk is finite (visited set) and restartable: construct a new
    /// walk to start over.
    pub async fn history(&self, branch: &str) -> Result<HistoryWalk<G>> {
        let head = self.get_branch(branch).await?.head;
        let head_commit = self.get_commit(&head).await?;
        Ok(HistoryWalk::new(Arc::clone(&self.graph), head_commit))
    }

    async fn branch_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.branch_locks.lock().await;
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Whether `candidate` is `ancestor` or a descendant of it, walking
    /// parent links from `candidate`.
    async fn is_descendant(&self, candidate: &CommitId, ancestor: &CommitId) -> Result<bool> {
        if candidate == ancestor {
            return Ok(true);
        }
        let mut frontier = vec![candidate.clone()];
        let mut visited = HashSet::new();
        while let Some(id) = frontier.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let commit = self.get_commit(&id).await?;
            for parent in commit.parents {
                if &parent == ancestor {
                    return Ok(true);
                }
                frontier.push(parent);
            }
        }
        Ok(false)
    }
}

/// Heap entry ordered by (timestamp, id), newest first.
struct FrontierEntry(Commit);

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp == other.0.timestamp && self.0.id == other.0.id
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .timestamp
            .cmp(&other.0.timestamp)
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// Lazy newest-first traversal of a commit's ancestry.
///
/// Because timestamps are issued strictly increasing and always after
/// every parent, popping the max-heap yields a total order consistent
/// with the DAG; `(timestamp, id)` breaks ties between concurrent
/// lineages. Each commit is yielded at most once even when reachable
/// through multiple parents (merges).
pub struct HistoryWalk<G: CommitGraph> {
    graph: Arc<G>,
    frontier: BinaryHeap<FrontierEntry>,
    visited: HashSet<CommitId>,
}

impl<G: CommitGraph> HistoryWalk<G> {
    fn new(graph: Arc<G>, head: Commit) -> Self {
        let mut frontier = BinaryHeap::new();
        frontier.push(FrontierEntry(head));
        Self {
            graph,
            frontier,
            visited: HashSet::new(),
        }
    }

    /// Yield the next commit, or `None` when the roots are exhausted.
    pub async fn next(&mut self) -> Result<Option<Commit>> {
        while let Some(FrontierEntry(commit)) = self.frontier.pop() {
            if !self.visited.insert(commit.id.clone()) {
                continue;
            }
            for parent in &commit.parents {
                if self.visited.contains(parent) {
                    continue;
                }
                let parent_commit = self
                    .graph
                    .get_commit(parent)
                    .await?
                    .ok_or_else(|| EngineError::UnknownCommit(parent.to_string()))?;
                self.frontier.push(FrontierEntry(parent_commit));
            }
            return Ok(Some(commit));
        }
        Ok(None)
    }

    /// Drain the walk into a vector (history is finite).
    pub async fn collect(mut self) -> Result<Vec<Commit>> {
        let mut out = Vec::new();
        while let Some(commit) = self.next().await? {
            out.push(commit);
        }
        Ok(out)
    }
}
