use chrono::Utc;
use shipway_state::storage_traits::{Commit, CommitGraph};
use shipway_state::{CommitId, SurrealStore};

#[tokio::test]
async fn test_duplicate_commit_is_idempotent() {
    let store = SurrealStore::in_memory().await.unwrap();

    let id = CommitId::compute(&[], "alice", "initial");
    let commit = Commit {
        id: id.clone(),
        parents: vec![],
        author: "alice".to_string(),
        message: "initial".to_string(),
        timestamp: Utc::now(),
    };

    let first = store.put_commit(&commit).await.unwrap();

    // Re-adding the same content-addressed commit returns the stored one
    // rather than violating the UNIQUE index on commit_id.
    let mut replay = commit.clone();
    replay.timestamp = Utc::now();
    let second = store.put_commit(&replay).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        first.timestamp, second.timestamp,
        "replayed put must not overwrite the stored commit"
    );
}

#[tokio::test]
async fn test_different_message_yields_different_commit() {
    let store = SurrealStore::in_memory().await.unwrap();

    let a = CommitId::compute(&[], "alice", "first");
    let b = CommitId::compute(&[], "alice", "second");
    assert_ne!(a, b);

    for (id, message) in [(a.clone(), "first"), (b.clone(), "second")] {
        let commit = Commit {
            id,
            parents: vec![],
            author: "alice".to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        store.put_commit(&commit).await.unwrap();
    }

    assert!(store.contains_commit(&a).await.unwrap());
    assert!(store.contains_commit(&b).await.unwrap());
}
