//! Engine event bus.
//!
//! Every externally observable state transition is published as an
//! [`EngineEvent`] on a `tokio::sync::broadcast` channel. Subscribers
//! (orchestrator, webhook notifier, tests) attach via
//! [`EventBus::subscribe`] and lag independently; a slow subscriber
//! drops its own backlog, never the publisher's.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use shipway_state::{RunId, StageOutcome};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// State-transition events published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    CommitAdded {
        commit_id: String,
        author: String,
    },
    BranchCreated {
        name: String,
        head: String,
    },
    BranchUpdated {
        name: String,
        old_head: String,
        new_head: String,
        forced: bool,
    },
    BranchDeleted {
        name: String,
    },
    RunQueued {
        run_id: RunId,
        branch: String,
        commit_id: String,
        attempt: u32,
    },
    RunStarted {
        run_id: RunId,
    },
    StageCompleted {
        run_id: RunId,
        stage: String,
        outcome: StageOutcome,
    },
    RunCompleted {
        run_id: RunId,
        success: bool,
    },
    RetryScheduled {
        branch: String,
        commit_id: String,
        next_attempt: u32,
        delay_ms: u64,
    },
    RetriesExhausted {
        branch: String,
        commit_id: String,
        attempts: u32,
    },
    InstanceDeployed {
        instance_id: String,
        commit_id: String,
    },
    InstanceRolledBack {
        instance_id: String,
        commit_id: String,
    },
}

/// Broadcast bus carrying [`EngineEvent`]s to in-process subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. With no live subscribers the event is dropped,
    /// which is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
