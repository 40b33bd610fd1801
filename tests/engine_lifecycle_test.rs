//! Integration tests for the PR lifecycle: a PR appears, its head
//! moves, and it closes. Each drives a full engine over the in-memory
//! store and observes the statuses published back onto the metadata
//! branch.

mod support;

use std::time::Duration;

use alder::CommitHash;
use alder::Engine;
use alder::Mirror;
use alder::StatusState;
use alder::TargetId;
use alder::TargetKind;
use alder::TreePath;
use support::*;

fn pr_target(number: u64) -> TargetId {
    TargetId {
        project: project(),
        kind: TargetKind::Pr(number),
    }
}

fn ci_context() -> TreePath {
    TreePath::parse("t").unwrap()
}

async fn published_state(
    store: &std::sync::Arc<alder::MemoryStore>,
    hash: &str,
) -> Option<StatusState> {
    let mirror = Mirror::new(&**store);
    let snapshot = mirror.snapshot().await.ok()?;
    snapshot
        .commit_state(&project(), &CommitHash::new(hash).unwrap(), &ci_context())
        .await
        .ok()?
        .state
}

#[tokio::test]
async fn test_new_pr_is_evaluated_and_published() {
    init_tracing();
    let store = alder::MemoryStore::new();
    seed(&store, &[
        ("foo/bar/pr/7/head", &format!("{HASH_A}\n")),
        ("foo/bar/pr/7/title", "x\n"),
    ])
    .await;

    let engine = Engine::new(config_for(store.clone(), const_pipelines()));
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    wait_for("target to appear", || {
        let engine = engine.clone();
        async move { engine.target(&pr_target(7)).is_some() }
    })
    .await;
    assert_eq!(engine.jobs(&pr_target(7)).len(), 1);
    assert_eq!(engine.title(&pr_target(7)).as_deref(), Some("x"));

    wait_for("status publication", || {
        let store = store.clone();
        async move { published_state(&store, HASH_A).await == Some(StatusState::Success) }
    })
    .await;
    assert_eq!(
        head_message(&store).await,
        "Set state of PR#7 (commit=abcdef;title=x): t = success"
    );

    // The publication itself produces a snapshot; the unchanged triple
    // must not be republished.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        head_message(&store).await,
        "Set state of PR#7 (commit=abcdef;title=x): t = success"
    );

    engine.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_head_update_keeps_identity_and_republishes() {
    init_tracing();
    let store = alder::MemoryStore::new();
    seed(&store, &[
        ("foo/bar/pr/7/head", &format!("{HASH_A}\n")),
        ("foo/bar/pr/7/title", "x\n"),
    ])
    .await;

    let engine = Engine::new(config_for(store.clone(), const_pipelines()));
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    wait_for("first publication", || {
        let store = store.clone();
        async move { published_state(&store, HASH_A).await == Some(StatusState::Success) }
    })
    .await;
    let before = engine.target(&pr_target(7)).unwrap();

    // The forge bridge moves the PR head.
    seed(&store, &[("foo/bar/pr/7/head", &format!("{HASH_B}\n"))]).await;

    // Same description, new hash: the status must be published again
    // for the new commit.
    wait_for("republication for the new head", || {
        let store = store.clone();
        async move { published_state(&store, HASH_B).await == Some(StatusState::Success) }
    })
    .await;

    let after = engine.target(&pr_target(7)).unwrap();
    assert!(
        std::sync::Arc::ptr_eq(&before, &after),
        "target identity must be stable across head updates"
    );
    assert_eq!(after.head().as_str(), HASH_B);

    engine.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closed_pr_is_dropped() {
    init_tracing();
    let store = alder::MemoryStore::new();
    seed(&store, &[
        ("foo/bar/pr/7/head", &format!("{HASH_A}\n")),
        ("foo/bar/pr/7/title", "x\n"),
    ])
    .await;

    let engine = Engine::new(config_for(store.clone(), const_pipelines()));
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    wait_for("publication", || {
        let store = store.clone();
        async move { published_state(&store, HASH_A).await == Some(StatusState::Success) }
    })
    .await;

    // The PR closes: it disappears from the metadata tree.
    remove(&store, "foo/bar/pr/7").await;

    wait_for("target removal", || {
        let engine = engine.clone();
        async move { engine.target(&pr_target(7)).is_none() }
    })
    .await;

    // No further publication happens for the dead target: the head
    // stays at the forge's removal commit.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(head_message(&store).await, "forge update");

    engine.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_ref_targets_are_tracked() {
    init_tracing();
    let store = alder::MemoryStore::new();
    seed(&store, &[("foo/bar/ref/heads/main/head", &format!("{HASH_A}\n"))]).await;

    let engine = Engine::new(config_for(store.clone(), const_pipelines()));
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    let target = TargetId {
        project: project(),
        kind: TargetKind::Ref(TreePath::parse("heads/main").unwrap()),
    };
    wait_for("ref target", || {
        let engine = engine.clone();
        let target = target.clone();
        async move { engine.target(&target).is_some() }
    })
    .await;

    wait_for("ref publication", || {
        let store = store.clone();
        async move { published_state(&store, HASH_A).await == Some(StatusState::Success) }
    })
    .await;
    assert_eq!(
        head_message(&store).await,
        "Set state of Ref heads/main (commit=abcdef): t = success"
    );

    engine.shutdown();
    runner.await.unwrap().unwrap();
}
