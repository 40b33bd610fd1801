//! Content-addressed build cache backed by store branches.
//!
//! A cache entry is a store branch named by the fingerprint of a build's
//! inputs; its tip commit stores the result and the captured log. The
//! cache guarantees at-most-one in-flight build per fingerprint
//! (coincident demands share the running computation and its live log),
//! persistence across restarts, and atomic visibility: a result is
//! either fully committed or absent.
//!
//! Invalidation is lazy: forcing an entry's [`RebuildTrigger`] commits a
//! `rebuild` marker onto the branch, and the next demand re-executes the
//! recipe, replacing the marker along with the stale result.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::MAX_TRANSACTION_ATTEMPTS;
use crate::error::EngineError;
use crate::error::Result;
use crate::error::StoreSnafu;
use crate::logs::LiveLog;
use crate::logs::LiveLogs;
use crate::path::CommitHash;
use crate::path::TreePath;
use crate::store::Branch;
use crate::store::CommitId;
use crate::store::StoreCommit;
use crate::store::StoreError;
use crate::store::Transaction;
use crate::store::Tree;
use crate::store::TreeStore;

/// File holding the serialized [`BuildOutcome`] on a cache branch.
const RESULT_FILE: &str = "result";
/// File holding the captured build log on a cache branch.
const LOG_FILE: &str = "log";
/// Marker file requesting re-execution on next demand.
const REBUILD_FILE: &str = "rebuild";

/// Inputs a recipe is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInput {
    /// Commit the build runs against.
    pub commit: CommitHash,
}

/// A memoized unit of side-effectful work.
#[async_trait]
pub trait Recipe: Send + Sync {
    /// Stable name; part of the fingerprint and the branch name.
    fn label(&self) -> &str;

    /// Run the build, writing progress to `log`. Implementations should
    /// poll `cancel` at their own suspension points.
    async fn build(
        &self,
        input: &BuildInput,
        log: &LiveLog,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, String>;
}

/// Final result of one build, persisted on the cache branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    /// Whether the build succeeded.
    pub ok: bool,
    /// Success description or failure message.
    pub message: String,
    /// When the build finished.
    pub built_at: DateTime<Utc>,
}

impl BuildOutcome {
    /// The outcome as a result over its message.
    pub fn as_result(&self) -> std::result::Result<&str, &str> {
        if self.ok {
            Ok(&self.message)
        } else {
            Err(&self.message)
        }
    }
}

/// Shared handle on a build that is still running.
pub type BuildWait = Shared<BoxFuture<'static, BuildOutcome>>;

/// Lazy one-shot invalidation handle for a saved cache entry.
#[derive(Clone)]
pub struct RebuildTrigger {
    inner: Arc<RebuildInner>,
}

struct RebuildInner {
    store: Arc<dyn TreeStore>,
    branch: String,
    forced: AtomicBool,
}

impl RebuildTrigger {
    fn new(store: Arc<dyn TreeStore>, branch: String) -> Self {
        Self {
            inner: Arc::new(RebuildInner {
                store,
                branch,
                forced: AtomicBool::new(false),
            }),
        }
    }

    /// Branch this trigger invalidates.
    pub fn branch(&self) -> &str {
        &self.inner.branch
    }

    /// Whether this trigger has already been forced.
    pub fn is_forced(&self) -> bool {
        self.inner.forced.load(Ordering::Acquire)
    }

    /// Invalidate the entry: commit the rebuild marker so the next
    /// demand re-executes. One-shot; later calls are no-ops.
    pub async fn force(&self) -> Result<()> {
        if self.inner.forced.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let branch = self.inner.store.branch(&self.inner.branch);
        for _ in 0..MAX_TRANSACTION_ATTEMPTS {
            let mut txn = branch.transaction().await.context(StoreSnafu {
                context: format!("invalidating {}", self.inner.branch),
            })?;
            txn.create_or_replace_file(&rebuild_path(), b"")
                .await
                .context(StoreSnafu {
                    context: format!("invalidating {}", self.inner.branch),
                })?;
            match txn.commit("Request rebuild").await {
                Ok(()) => {
                    info!(branch = %self.inner.branch, "cache entry invalidated");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => {
                    return Err(err).context(StoreSnafu {
                        context: format!("invalidating {}", self.inner.branch),
                    })
                }
            }
        }
        Err(EngineError::Store {
            context: format!("invalidating {}", self.inner.branch),
            source: StoreError::Conflict {
                branch: self.inner.branch.clone(),
            },
        })
    }
}

/// Where a demanded build's log can be found, possibly composed.
#[derive(Clone)]
pub enum LogTree {
    /// No log.
    Empty,
    /// A build currently running.
    Live {
        /// Cache branch name.
        branch: String,
        /// Its live log.
        log: Arc<LiveLog>,
    },
    /// A completed build persisted on a cache branch.
    Saved {
        /// Cache branch name.
        branch: String,
        /// Commit holding the result.
        commit: CommitId,
        /// Lazy invalidation handle.
        rebuild: RebuildTrigger,
    },
    /// Logs of two sub-computations.
    Pair {
        /// Left side.
        left: Box<LogTree>,
        /// Right side.
        right: Box<LogTree>,
    },
}

impl LogTree {
    /// Combine two log trees, dropping empty sides.
    pub fn pair(left: LogTree, right: LogTree) -> LogTree {
        match (left, right) {
            (LogTree::Empty, right) => right,
            (left, LogTree::Empty) => left,
            (left, right) => LogTree::Pair {
                left: Box::new(left),
                right: Box::new(right),
            },
        }
    }

    /// Whether any node references `branch` as a saved log.
    pub fn references_saved(&self, branch: &str) -> bool {
        match self {
            LogTree::Saved { branch: b, .. } => b == branch,
            LogTree::Pair { left, right } => {
                left.references_saved(branch) || right.references_saved(branch)
            }
            LogTree::Empty | LogTree::Live { .. } => false,
        }
    }
}

/// Outcome of demanding a cache entry.
pub enum CacheLookup {
    /// The entry is complete; the result is available now.
    Done {
        /// Persisted outcome.
        outcome: BuildOutcome,
        /// Saved log location.
        log: LogTree,
    },
    /// A build is running; await `wait` for its outcome.
    InFlight {
        /// Shared completion handle.
        wait: BuildWait,
        /// Live log location.
        log: LogTree,
    },
}

/// The build cache.
pub struct BuildCache {
    store: Arc<dyn TreeStore>,
    logs: Arc<LiveLogs>,
    // Holding this across the head probe and log registration keeps
    // demand/build-start serialized, which is what enforces the
    // one-builder-per-fingerprint invariant.
    pending: Mutex<HashMap<String, BuildWait>>,
}

impl BuildCache {
    /// Create a cache over `store`, registering live logs in `logs`.
    pub fn new(store: Arc<dyn TreeStore>, logs: Arc<LiveLogs>) -> Arc<Self> {
        Arc::new(Self {
            store,
            logs,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The branch name for one recipe/input pair.
    pub fn branch_name(recipe: &dyn Recipe, input: &BuildInput) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(recipe.label().as_bytes());
        hasher.update(&[0]);
        hasher.update(input.commit.as_str().as_bytes());
        let fingerprint = hasher.finalize().to_hex();
        format!("build/{}/{}", recipe.label(), &fingerprint.as_str()[..16])
    }

    /// Demand the entry for `recipe` at `input`.
    ///
    /// Returns the persisted outcome when complete, otherwise attaches
    /// to (or starts) the single in-flight build.
    pub async fn demand(
        self: &Arc<Self>,
        recipe: Arc<dyn Recipe>,
        input: BuildInput,
    ) -> Result<CacheLookup> {
        let branch_name = Self::branch_name(recipe.as_ref(), &input);
        let mut pending = self.pending.lock().await;

        if let Some(wait) = pending.get(&branch_name) {
            let log = match self.logs.lookup(&branch_name) {
                Some(log) => LogTree::Live {
                    branch: branch_name.clone(),
                    log,
                },
                None => LogTree::Empty,
            };
            return Ok(CacheLookup::InFlight {
                wait: wait.clone(),
                log,
            });
        }

        let branch = self.store.branch(&branch_name);
        if let Some(head) = branch.head().await.context(StoreSnafu {
            context: format!("probing cache entry {branch_name}"),
        })? {
            let tree = head.tree();
            let invalidated = tree.exists_file(&rebuild_path()).await.context(StoreSnafu {
                context: format!("probing cache entry {branch_name}"),
            })?;
            if !invalidated {
                match tree.read_file(&result_path()).await {
                    Ok(bytes) => match serde_json::from_slice::<BuildOutcome>(&bytes) {
                        Ok(outcome) => {
                            debug!(branch = %branch_name, "cache hit");
                            return Ok(CacheLookup::Done {
                                outcome,
                                log: LogTree::Saved {
                                    branch: branch_name.clone(),
                                    commit: head.id().clone(),
                                    rebuild: RebuildTrigger::new(self.store.clone(), branch_name),
                                },
                            });
                        }
                        Err(err) => {
                            warn!(branch = %branch_name, error = %err,
                                  "corrupt cache entry, rebuilding");
                        }
                    },
                    Err(err) if err.is_no_entry() => {
                        // A branch with commits but no result: a half
                        // branch from an interrupted writer. Rebuild.
                    }
                    Err(err) => {
                        return Err(err).context(StoreSnafu {
                            context: format!("reading cache entry {branch_name}"),
                        })
                    }
                }
            }
        }

        // Start the single build for this fingerprint.
        let cancel = CancellationToken::new();
        let log = self.logs.create(&branch_name, Some(cancel.clone()))?;
        let wait: BuildWait = {
            let cache = self.clone();
            let log = log.clone();
            let branch_name = branch_name.clone();
            async move { cache.execute(recipe, input, branch_name, log, cancel).await }
                .boxed()
                .shared()
        };
        pending.insert(branch_name.clone(), wait.clone());
        drop(pending);

        // Drive the build even if every demander detaches.
        tokio::spawn({
            let wait = wait.clone();
            async move {
                let _ = wait.await;
            }
        });

        Ok(CacheLookup::InFlight {
            wait,
            log: LogTree::Live {
                branch: branch_name,
                log,
            },
        })
    }

    async fn execute(
        self: Arc<Self>,
        recipe: Arc<dyn Recipe>,
        input: BuildInput,
        branch_name: String,
        log: Arc<LiveLog>,
        cancel: CancellationToken,
    ) -> BuildOutcome {
        info!(branch = %branch_name, commit = %input.commit.short(), "build started");
        let result = tokio::select! {
            _ = cancel.cancelled() => Err("build cancelled".to_string()),
            result = recipe.build(&input, &log, &cancel) => result,
        };
        let outcome = BuildOutcome {
            ok: result.is_ok(),
            message: match result {
                Ok(message) | Err(message) => message,
            },
            built_at: Utc::now(),
        };

        if cancel.is_cancelled() {
            info!(branch = %branch_name, "build cancelled, nothing persisted");
        } else {
            let text = log.contents().await;
            if let Err(err) = self.persist(&branch_name, &outcome, &text).await {
                // The entry stays absent and will be rebuilt on next
                // demand; the outcome is still handed to demanders.
                warn!(branch = %branch_name, error = %err, "failed to persist build result");
            }
        }

        self.logs.close(&log).await;
        self.pending.lock().await.remove(&branch_name);
        info!(branch = %branch_name, ok = outcome.ok, "build finished");
        outcome
    }

    async fn persist(
        &self,
        branch_name: &str,
        outcome: &BuildOutcome,
        log_text: &str,
    ) -> std::result::Result<(), StoreError> {
        let json = serde_json::to_vec(outcome).map_err(|err| StoreError::Backend {
            message: format!("serializing build outcome: {err}"),
        })?;
        let branch = self.store.branch(branch_name);
        for _ in 0..MAX_TRANSACTION_ATTEMPTS {
            let mut txn = branch.transaction().await?;
            txn.create_or_replace_file(&result_path(), &json).await?;
            txn.create_or_replace_file(&log_path(), log_text.as_bytes()).await?;
            match txn.remove(&rebuild_path()).await {
                Ok(()) => {}
                Err(err) if err.is_no_entry() => {}
                Err(err) => return Err(err),
            }
            match txn.commit("Record build result").await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Conflict {
            branch: branch_name.to_string(),
        })
    }
}

fn result_path() -> TreePath {
    TreePath::parse(RESULT_FILE).expect("static path is valid")
}

fn log_path() -> TreePath {
    TreePath::parse(LOG_FILE).expect("static path is valid")
}

fn rebuild_path() -> TreePath {
    TreePath::parse(REBUILD_FILE).expect("static path is valid")
}
