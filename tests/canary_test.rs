//! Canary filtering and monitoring markers.

mod support;

use std::collections::HashSet;
use std::time::Duration;

use alder::Engine;
use alder::TargetId;
use alder::TargetKind;
use alder::TreePath;
use alder::TreeStore as _;
use alder::constants::METADATA_BRANCH;
use alder::store::Branch as _;
use alder::store::StoreCommit as _;
use alder::store::Tree as _;
use support::*;

fn pr_target(number: u64) -> TargetId {
    TargetId {
        project: project(),
        kind: TargetKind::Pr(number),
    }
}

#[tokio::test]
async fn test_canary_filter_drops_other_targets() {
    init_tracing();
    let store = alder::MemoryStore::new();
    seed(&store, &[
        ("foo/bar/pr/7/head", &format!("{HASH_A}\n")),
        ("foo/bar/pr/7/title", "in canary\n"),
        ("foo/bar/pr/8/head", &format!("{HASH_B}\n")),
        ("foo/bar/pr/8/title", "not in canary\n"),
    ])
    .await;

    let config = config_for(store.clone(), const_pipelines())
        .with_canaries(project(), HashSet::from([TargetKind::Pr(7)]));
    let engine = Engine::new(config);
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    wait_for("canary target", || {
        let engine = engine.clone();
        async move { engine.target(&pr_target(7)).is_some() }
    })
    .await;

    // The non-canary PR is silently dropped.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.target(&pr_target(8)).is_none());
    let projects = engine.projects();
    assert_eq!(projects[&project()].prs.len(), 1);

    engine.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_engine_enables_monitoring_markers() {
    init_tracing();
    let store = alder::MemoryStore::new();
    seed(&store, &[("foo/bar/pr/7/head", &format!("{HASH_A}\n"))]).await;

    let engine = Engine::new(config_for(store.clone(), const_pipelines()));
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    wait_for("monitor marker", || {
        let store = store.clone();
        async move {
            let Some(head) = store.branch(METADATA_BRANCH).head().await.unwrap() else {
                return false;
            };
            head.tree()
                .exists_file(&TreePath::parse("foo/bar/.monitor").unwrap())
                .await
                .unwrap()
        }
    })
    .await;

    engine.shutdown();
    runner.await.unwrap().unwrap();
}
