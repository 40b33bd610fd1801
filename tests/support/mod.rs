//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use alder::EngineConfig;
use alder::MemoryStore;
use alder::ProjectId;
use alder::TreePath;
use alder::TreeStore;
use alder::cache::BuildInput;
use alder::cache::Recipe;
use alder::config::PipelineFactory;
use alder::config::StoreConnector;
use alder::constants::METADATA_BRANCH;
use alder::logs::LiveLog;
use alder::store::Branch as _;
use alder::store::StoreCommit;
use alder::store::Transaction as _;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub const HASH_A: &str = "abcdef0123456789abcdef0123456789abcdef01";
pub const HASH_B: &str = "beef123456789abcdef0123456789abcdef01234";

/// Overall deadline for every polling wait in these tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("alder=debug")
        .try_init();
}

pub fn project() -> ProjectId {
    ProjectId::new("foo", "bar").unwrap()
}

/// Commit a batch of files onto the metadata branch.
pub async fn seed(store: &Arc<MemoryStore>, files: &[(&str, &str)]) {
    let branch = store.branch(METADATA_BRANCH);
    let mut txn = branch.transaction().await.unwrap();
    for (path, data) in files {
        txn.create_or_replace_file(&TreePath::parse(path).unwrap(), data.as_bytes())
            .await
            .unwrap();
    }
    txn.commit("forge update").await.unwrap();
}

/// Remove a subtree from the metadata branch.
pub async fn remove(store: &Arc<MemoryStore>, path: &str) {
    let branch = store.branch(METADATA_BRANCH);
    let mut txn = branch.transaction().await.unwrap();
    txn.remove(&TreePath::parse(path).unwrap()).await.unwrap();
    txn.commit("forge update").await.unwrap();
}

/// The message of the metadata branch's head commit.
pub async fn head_message(store: &Arc<MemoryStore>) -> String {
    store
        .branch(METADATA_BRANCH)
        .head()
        .await
        .unwrap()
        .map(|commit| commit.message().to_string())
        .unwrap_or_default()
}

/// Connector handing out the same in-memory store on every connect.
pub fn connector_for(store: Arc<MemoryStore>) -> StoreConnector {
    Arc::new(move || {
        let store = store.clone();
        Box::pin(async move { Ok(store as Arc<dyn TreeStore>) })
    })
}

/// Engine config for one project over `store`.
pub fn config_for(store: Arc<MemoryStore>, pipelines: PipelineFactory) -> EngineConfig {
    EngineConfig::new("http://ci.example.org", connector_for(store))
        .with_project(project(), pipelines)
        .with_reconnect_backoff(Duration::from_millis(20))
}

/// A pipeline map with a single constant job `t`.
pub fn const_pipelines() -> PipelineFactory {
    Arc::new(|_| {
        let mut map = BTreeMap::new();
        map.insert("t".to_string(), alder::Term::value("ok"));
        map
    })
}

/// Poll `check` until it yields true or the deadline passes.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = tokio::time::timeout(WAIT_TIMEOUT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

/// Recipe that counts its runs and succeeds immediately.
pub struct CountingRecipe {
    label: String,
    pub runs: AtomicU32,
}

impl CountingRecipe {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            runs: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Recipe for CountingRecipe {
    fn label(&self) -> &str {
        &self.label
    }

    async fn build(
        &self,
        input: &BuildInput,
        log: &LiveLog,
        _cancel: &CancellationToken,
    ) -> Result<String, String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        log.append(&format!("checked {}\n", input.commit.short())).await;
        Ok(format!("run {}", self.runs.load(Ordering::SeqCst)))
    }
}
