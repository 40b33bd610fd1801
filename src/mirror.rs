//! Metadata mirror over the forge state branch.
//!
//! The forge bridge writes PR, ref and commit-status state onto the
//! `github-metadata` branch as a file tree:
//!
//! ```text
//! <user>/<repo>/pr/<n>/head          hex commit hash
//! <user>/<repo>/pr/<n>/title         title
//! <user>/<repo>/ref/<name...>/head   hex commit hash
//! <user>/<repo>/commit/<hash>/status/<ci-context...>/state
//!                                   /description
//!                                   /target_url   (may be absent)
//! <user>/<repo>/.monitor             empty marker
//! ```
//!
//! This module projects that tree into typed snapshots and writes status
//! updates back through branch transactions. Snapshots are immutable
//! views at a single store commit; forge writes go through a separate
//! transaction that advances the metadata branch.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::MAX_DIR_ENTRIES;
use crate::constants::MAX_REF_DEPTH;
use crate::constants::MAX_TRANSACTION_ATTEMPTS;
use crate::constants::METADATA_BRANCH;
use crate::constants::MONITOR_MARKER;
use crate::constants::TRANSACTION_RETRY_BACKOFF_MS;
use crate::path::CommitHash;
use crate::path::ProjectId;
use crate::path::Step;
use crate::path::TreePath;
use crate::store::Branch;
use crate::store::CommitId;
use crate::store::HeadWait;
use crate::store::StoreCommit;
use crate::store::StoreError;
use crate::store::Transaction;
use crate::store::Tree;
use crate::store::TreeStore;

/// Result type for mirror operations.
pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

/// Mirror failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MirrorError {
    /// The metadata branch has no head; the forge bridge has not
    /// populated the store yet.
    #[snafu(display("metadata branch {branch} does not exist"))]
    MetadataBranchMissing {
        /// Branch name.
        branch: String,
    },

    /// Underlying store failure (other than `NoEntry`, which is handled
    /// in place).
    #[snafu(display("store failure while {context}: {source}"))]
    Store {
        /// What the mirror was doing.
        context: String,
        /// Store error.
        source: StoreError,
    },

    /// A metadata transaction kept conflicting.
    #[snafu(display("metadata transaction conflicted {attempts} times"))]
    TooManyConflicts {
        /// Attempts made.
        attempts: u32,
    },

    /// The monitor was cancelled.
    #[snafu(display("monitor aborted"))]
    Aborted,
}

/// Commit status state vocabulary, case-sensitive on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    /// Infrastructure error.
    Error,
    /// Evaluation in progress.
    Pending,
    /// Succeeded.
    Success,
    /// Failed.
    Failure,
}

impl StatusState {
    /// Wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Error => "error",
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
        }
    }

    /// Parse the exact wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(StatusState::Error),
            "pending" => Some(StatusState::Pending),
            "success" => Some(StatusState::Success),
            "failure" => Some(StatusState::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open pull request as mirrored from the forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Owning project.
    pub project: ProjectId,
    /// PR number.
    pub number: u64,
    /// Title, or the `Bad title: ...` placeholder when unreadable.
    pub title: String,
    /// Head commit.
    pub head: CommitHash,
}

/// A ref (branch or tag) as mirrored from the forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeRef {
    /// Owning project.
    pub project: ProjectId,
    /// Name segments, e.g. `heads/main` or `tags/v1.0.0`.
    pub name: TreePath,
    /// Head commit.
    pub head: CommitHash,
}

/// The three status leaves recorded for a commit under one CI context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitStatus {
    /// Status state, if present and well-formed.
    pub state: Option<StatusState>,
    /// Description, if present.
    pub description: Option<String>,
    /// Target URL, if present.
    pub target_url: Option<String>,
}

/// PRs and refs of one project at one snapshot.
#[derive(Debug, Default)]
pub struct ProjectSnapshot {
    /// Open PRs indexed by number.
    pub prs: BTreeMap<u64, PullRequest>,
    /// Refs indexed by name.
    pub refs: BTreeMap<TreePath, ForgeRef>,
}

struct SnapshotInner {
    commit: Arc<dyn StoreCommit>,
    // Per-project materialization is lazy; the async mutex also
    // serializes first-time walks so each project is read exactly once.
    projects: Mutex<HashMap<ProjectId, Arc<ProjectSnapshot>>>,
}

/// An immutable view over the mirror at a specific store commit.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    fn new(commit: Arc<dyn StoreCommit>) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                commit,
                projects: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Id of the store commit this snapshot reads.
    pub fn commit_id(&self) -> &CommitId {
        self.inner.commit.id()
    }

    fn tree(&self) -> Arc<dyn Tree> {
        self.inner.commit.tree()
    }

    /// PRs and refs of `project`, materialized on first call and cached
    /// inside the snapshot.
    pub async fn project(&self, project: &ProjectId) -> Result<Arc<ProjectSnapshot>> {
        let mut projects = self.inner.projects.lock().await;
        if let Some(cached) = projects.get(project) {
            return Ok(cached.clone());
        }
        let materialized = Arc::new(self.load_project(project).await?);
        projects.insert(project.clone(), materialized.clone());
        Ok(materialized)
    }

    async fn load_project(&self, project: &ProjectId) -> Result<ProjectSnapshot> {
        let tree = self.tree();
        let base = project.tree_path();

        let mut prs = BTreeMap::new();
        let pr_dir = base.child(step("pr"));
        match tree.read_dir(&pr_dir).await {
            Ok(mut entries) => {
                if entries.len() > MAX_DIR_ENTRIES {
                    warn!(project = %project, total = entries.len(), limit = MAX_DIR_ENTRIES,
                          "PR directory too large, truncating walk");
                    entries.truncate(MAX_DIR_ENTRIES);
                }
                for entry in entries {
                    let number: u64 = match entry.as_str().parse() {
                        Ok(n) => n,
                        Err(_) => {
                            warn!(project = %project, entry = %entry, "skipping malformed PR number");
                            continue;
                        }
                    };
                    if let Some(pr) = self.load_pr(&tree, project, number).await? {
                        prs.insert(number, pr);
                    }
                }
            }
            Err(err) if err.is_no_entry() => {}
            Err(err) => {
                return Err(err).context(StoreSnafu {
                    context: format!("listing PRs of {project}"),
                })
            }
        }

        let mut refs = BTreeMap::new();
        let ref_dir = base.child(step("ref"));
        self.walk_refs(&tree, project, &ref_dir, &TreePath::root(), 0, &mut refs)
            .await?;

        Ok(ProjectSnapshot { prs, refs })
    }

    async fn load_pr(
        &self,
        tree: &Arc<dyn Tree>,
        project: &ProjectId,
        number: u64,
    ) -> Result<Option<PullRequest>> {
        let dir = project
            .tree_path()
            .child(step("pr"))
            .child(Step::new(number.to_string()).expect("numbers are valid steps"));

        let head = match read_text(tree, &dir.child(step("head"))).await {
            Ok(text) => text,
            Err(err) if err.is_no_entry() => {
                debug!(project = %project, number, "PR has no head yet, skipping");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).context(StoreSnafu {
                    context: format!("reading head of {project}#{number}"),
                })
            }
        };
        let head = match CommitHash::new(head) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(project = %project, number, error = %err, "skipping PR with malformed head");
                return Ok(None);
            }
        };

        let title = match read_text(tree, &dir.child(step("title"))).await {
            Ok(text) => text,
            Err(err) => format!("Bad title: {err}"),
        };

        Ok(Some(PullRequest {
            project: project.clone(),
            number,
            title,
            head,
        }))
    }

    fn walk_refs<'a>(
        &'a self,
        tree: &'a Arc<dyn Tree>,
        project: &'a ProjectId,
        dir: &'a TreePath,
        name: &'a TreePath,
        depth: usize,
        refs: &'a mut BTreeMap<TreePath, ForgeRef>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth > MAX_REF_DEPTH {
                warn!(project = %project, dir = %dir, "ref tree too deep, pruning walk");
                return Ok(());
            }
            let mut entries = match tree.read_dir(dir).await {
                Ok(entries) => entries,
                Err(err) if err.is_no_entry() => return Ok(()),
                Err(err) => {
                    return Err(err).context(StoreSnafu {
                        context: format!("listing refs of {project}"),
                    })
                }
            };
            if entries.len() > MAX_DIR_ENTRIES {
                warn!(project = %project, dir = %dir, total = entries.len(), limit = MAX_DIR_ENTRIES,
                      "ref directory too large, truncating walk");
                entries.truncate(MAX_DIR_ENTRIES);
            }
            for entry in entries {
                let child_dir = dir.child(entry.clone());
                let child_name = name.child(entry);
                let head_path = child_dir.child(step("head"));
                let has_head = tree.exists_file(&head_path).await.context(StoreSnafu {
                    context: format!("probing ref {child_name} of {project}"),
                })?;
                if has_head {
                    let text = read_text(tree, &head_path).await.context(StoreSnafu {
                        context: format!("reading ref {child_name} of {project}"),
                    })?;
                    match CommitHash::new(text) {
                        Ok(head) => {
                            refs.insert(child_name.clone(), ForgeRef {
                                project: project.clone(),
                                name: child_name,
                                head,
                            });
                        }
                        Err(err) => {
                            warn!(project = %project, name = %child_name, error = %err,
                                  "skipping ref with malformed head");
                        }
                    }
                } else {
                    self.walk_refs(tree, project, &child_dir, &child_name, depth + 1, refs)
                        .await?;
                }
            }
            Ok(())
        })
    }

    /// A single PR, read lazily without materializing the project.
    pub async fn pr(&self, project: &ProjectId, number: u64) -> Result<Option<PullRequest>> {
        let tree = self.tree();
        self.load_pr(&tree, project, number).await
    }

    /// A single ref head, read lazily without materializing the project.
    pub async fn ref_head(&self, project: &ProjectId, name: &TreePath) -> Result<Option<CommitHash>> {
        let tree = self.tree();
        let path = project.tree_path().child(step("ref")).join(name).child(step("head"));
        match read_text(&tree, &path).await {
            Ok(text) => match CommitHash::new(text) {
                Ok(hash) => Ok(Some(hash)),
                Err(err) => {
                    warn!(project = %project, name = %name, error = %err, "malformed ref head");
                    Ok(None)
                }
            },
            Err(err) if err.is_no_entry() => Ok(None),
            Err(err) => Err(err).context(StoreSnafu {
                context: format!("reading ref {name} of {project}"),
            }),
        }
    }

    /// The status leaves recorded for `commit` under `ci` context.
    pub async fn commit_state(
        &self,
        project: &ProjectId,
        commit: &CommitHash,
        ci: &TreePath,
    ) -> Result<CommitStatus> {
        let tree = self.tree();
        let dir = status_dir(project, commit, ci);

        let mut status = CommitStatus::default();
        match read_text(&tree, &dir.child(step("state"))).await {
            Ok(text) => match StatusState::parse(&text) {
                Some(state) => status.state = Some(state),
                None => {
                    warn!(project = %project, commit = %commit, value = %text,
                          "ignoring malformed status state");
                }
            },
            Err(err) if err.is_no_entry() => {}
            Err(err) => {
                return Err(err).context(StoreSnafu {
                    context: format!("reading status of {commit}"),
                })
            }
        }
        status.description = read_optional(&tree, &dir.child(step("description")))
            .await
            .context(StoreSnafu {
                context: format!("reading status of {commit}"),
            })?;
        status.target_url = read_optional(&tree, &dir.child(step("target_url")))
            .await
            .context(StoreSnafu {
                context: format!("reading status of {commit}"),
            })?;
        Ok(status)
    }
}

/// Handle on the metadata branch.
#[derive(Clone)]
pub struct Mirror {
    branch: Arc<dyn Branch>,
}

impl Mirror {
    /// Wrap a store's metadata branch.
    pub fn new(store: &dyn TreeStore) -> Self {
        Self {
            branch: store.branch(METADATA_BRANCH),
        }
    }

    /// Read the branch head as a fresh [`Snapshot`].
    ///
    /// Fails with [`MirrorError::MetadataBranchMissing`] until the forge
    /// bridge has committed at least once.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let head = self.branch.head().await.context(StoreSnafu {
            context: "reading metadata head".to_string(),
        })?;
        match head {
            Some(commit) => Ok(Snapshot::new(commit)),
            None => MetadataBranchMissingSnafu {
                branch: METADATA_BRANCH,
            }
            .fail(),
        }
    }

    /// Stream each new metadata head to `on_snapshot` until cancelled.
    ///
    /// Heads are delivered monotonically; intermediate commits may be
    /// skipped. Returns [`MirrorError::Aborted`] (converted into `E`)
    /// when `cancel` trips.
    pub async fn monitor<F, Fut, E>(&self, mut on_snapshot: F, cancel: &CancellationToken) -> Result<(), E>
    where
        F: FnMut(Snapshot) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<MirrorError>,
    {
        let mut last_seen: Option<CommitId> = None;
        loop {
            let wait = self
                .branch
                .wait_for_head(last_seen.as_ref(), cancel)
                .await
                .context(StoreSnafu {
                    context: "waiting for metadata head".to_string(),
                })
                .map_err(E::from)?;
            match wait {
                HeadWait::Aborted => return Err(E::from(MirrorError::Aborted)),
                HeadWait::NewHead(None) => {
                    // Branch vanished (or never existed); keep waiting.
                    last_seen = None;
                }
                HeadWait::NewHead(Some(commit)) => {
                    last_seen = Some(commit.id().clone());
                    debug!(commit = %commit.id(), "metadata head advanced");
                    on_snapshot(Snapshot::new(commit)).await?;
                }
            }
        }
    }

    /// Publish a commit status: writes `state` and `description`
    /// (newline-terminated), writes or removes `target_url`, and commits
    /// with `message`. Retried on transient conflict.
    pub async fn set_state(
        &self,
        project: &ProjectId,
        commit: &CommitHash,
        ci: &TreePath,
        state: StatusState,
        description: &str,
        target_url: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let dir = status_dir(project, commit, ci);
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let mut txn = self.branch.transaction().await.context(StoreSnafu {
                context: format!("opening status transaction for {commit}"),
            })?;
            let write = async {
                txn.make_dirs(&dir).await?;
                txn.create_or_replace_file(&dir.child(step("state")), terminated(state.as_str()).as_bytes())
                    .await?;
                txn.create_or_replace_file(&dir.child(step("description")), terminated(description).as_bytes())
                    .await?;
                let url_path = dir.child(step("target_url"));
                match target_url {
                    Some(url) => {
                        txn.create_or_replace_file(&url_path, terminated(url).as_bytes())
                            .await?
                    }
                    None => match txn.remove(&url_path).await {
                        Ok(()) => {}
                        Err(err) if err.is_no_entry() => {}
                        Err(err) => return Err(err),
                    },
                }
                Ok(())
            }
            .await;
            if let Err(err) = write {
                txn.abort().await;
                return Err(err).context(StoreSnafu {
                    context: format!("writing status of {commit}"),
                });
            }
            match txn.commit(message).await {
                Ok(()) => {
                    info!(project = %project, commit = %commit.short(), state = %state, "published status");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    let jitter = rand::rng().random_range(0..TRANSACTION_RETRY_BACKOFF_MS);
                    debug!(commit = %commit.short(), attempt, "status transaction conflicted, retrying");
                    tokio::time::sleep(Duration::from_millis(TRANSACTION_RETRY_BACKOFF_MS + jitter)).await;
                }
                Err(err) => {
                    return Err(err).context(StoreSnafu {
                        context: format!("committing status of {commit}"),
                    })
                }
            }
        }
        TooManyConflictsSnafu {
            attempts: MAX_TRANSACTION_ATTEMPTS,
        }
        .fail()
    }

    /// Ensure each project carries a `.monitor` marker. One transaction;
    /// commits only if any marker was added.
    pub async fn enable_monitoring(&self, projects: &[ProjectId]) -> Result<()> {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let mut txn = self.branch.transaction().await.context(StoreSnafu {
                context: "opening monitoring transaction".to_string(),
            })?;
            let mut added = Vec::new();
            for project in projects {
                let marker = project
                    .tree_path()
                    .child(Step::new(MONITOR_MARKER).expect("marker is a valid step"));
                let exists = txn.exists_file(&marker).await.context(StoreSnafu {
                    context: format!("probing monitor marker of {project}"),
                })?;
                if !exists {
                    txn.make_dirs(&project.tree_path()).await.context(StoreSnafu {
                        context: format!("creating {project}"),
                    })?;
                    txn.create_file(&marker, b"").await.context(StoreSnafu {
                        context: format!("marking {project}"),
                    })?;
                    added.push(project.clone());
                }
            }
            if added.is_empty() {
                txn.abort().await;
                return Ok(());
            }
            let names: Vec<String> = added.iter().map(|p| p.to_string()).collect();
            match txn.commit(&format!("Monitor {}", names.join(", "))).await {
                Ok(()) => {
                    info!(projects = ?names, "enabled monitoring");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(attempt, "monitoring transaction conflicted, retrying");
                }
                Err(err) => {
                    return Err(err).context(StoreSnafu {
                        context: "committing monitoring markers".to_string(),
                    })
                }
            }
        }
        TooManyConflictsSnafu {
            attempts: MAX_TRANSACTION_ATTEMPTS,
        }
        .fail()
    }
}

fn step(s: &str) -> Step {
    Step::new(s).expect("static segment is valid")
}

fn status_dir(project: &ProjectId, commit: &CommitHash, ci: &TreePath) -> TreePath {
    project
        .tree_path()
        .child(step("commit"))
        .child(Step::new(commit.as_str()).expect("hashes are valid steps"))
        .child(step("status"))
        .join(ci)
}

fn terminated(s: &str) -> String {
    format!("{s}\n")
}

async fn read_text(tree: &Arc<dyn Tree>, path: &TreePath) -> std::result::Result<String, StoreError> {
    let bytes = tree.read_file(path).await?;
    let text = String::from_utf8(bytes).map_err(|err| StoreError::Backend {
        message: format!("{path} is not UTF-8: {err}"),
    })?;
    Ok(text.trim_end_matches('\n').to_string())
}

async fn read_optional(
    tree: &Arc<dyn Tree>,
    path: &TreePath,
) -> std::result::Result<Option<String>, StoreError> {
    match read_text(tree, path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.is_no_entry() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const HASH_A: &str = "abcdef0123456789abcdef0123456789abcdef01";
    const HASH_B: &str = "beef123456789abcdef0123456789abcdef01234";

    async fn seed(store: &MemoryStore, files: &[(&str, &str)]) {
        let branch = store.branch(METADATA_BRANCH);
        let mut txn = branch.transaction().await.unwrap();
        for (path, data) in files {
            txn.create_or_replace_file(&TreePath::parse(path).unwrap(), data.as_bytes())
                .await
                .unwrap();
        }
        txn.commit("seed").await.unwrap();
    }

    fn project() -> ProjectId {
        ProjectId::new("foo", "bar").unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_fails_without_metadata_branch() {
        let store = MemoryStore::new();
        let mirror = Mirror::new(&*store);
        assert!(matches!(
            mirror.snapshot().await,
            Err(MirrorError::MetadataBranchMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_project_materializes_prs_and_refs() {
        let store = MemoryStore::new();
        seed(&store, &[
            ("foo/bar/pr/7/head", &format!("{HASH_A}\n")),
            ("foo/bar/pr/7/title", "seven\n"),
            ("foo/bar/ref/heads/main/head", &format!("{HASH_B}\n")),
            ("foo/bar/ref/heads/release/v1/head", &format!("{HASH_A}\n")),
        ])
        .await;

        let snapshot = Mirror::new(&*store).snapshot().await.unwrap();
        let proj = snapshot.project(&project()).await.unwrap();

        assert_eq!(proj.prs.len(), 1);
        let pr = &proj.prs[&7];
        assert_eq!(pr.title, "seven");
        assert_eq!(pr.head.as_str(), HASH_A);

        assert_eq!(proj.refs.len(), 2);
        assert!(proj.refs.contains_key(&TreePath::parse("heads/main").unwrap()));
        assert!(proj
            .refs
            .contains_key(&TreePath::parse("heads/release/v1").unwrap()));
    }

    #[tokio::test]
    async fn test_malformed_prs_are_skipped() {
        let store = MemoryStore::new();
        seed(&store, &[
            ("foo/bar/pr/not-a-number/head", &format!("{HASH_A}\n")),
            ("foo/bar/pr/8/title", "headless\n"),
            ("foo/bar/pr/9/head", "nothex\n"),
            ("foo/bar/pr/10/head", &format!("{HASH_A}\n")),
        ])
        .await;

        let snapshot = Mirror::new(&*store).snapshot().await.unwrap();
        let proj = snapshot.project(&project()).await.unwrap();
        // Only #10 survives: bad number, missing head and bad head are
        // all skipped.
        assert_eq!(proj.prs.keys().copied().collect::<Vec<_>>(), vec![10]);
    }

    #[tokio::test]
    async fn test_oversized_pr_directory_is_truncated() {
        let store = MemoryStore::new();
        let branch = store.branch(METADATA_BRANCH);
        let mut txn = branch.transaction().await.unwrap();
        for number in 0..(MAX_DIR_ENTRIES + 5) {
            let path = TreePath::parse(&format!("foo/bar/pr/{number}/head")).unwrap();
            txn.create_or_replace_file(&path, format!("{HASH_A}\n").as_bytes())
                .await
                .unwrap();
        }
        txn.commit("seed").await.unwrap();

        let snapshot = Mirror::new(&*store).snapshot().await.unwrap();
        let proj = snapshot.project(&project()).await.unwrap();
        assert_eq!(proj.prs.len(), MAX_DIR_ENTRIES);
    }

    #[tokio::test]
    async fn test_missing_title_yields_placeholder() {
        let store = MemoryStore::new();
        seed(&store, &[("foo/bar/pr/7/head", &format!("{HASH_A}\n"))]).await;

        let snapshot = Mirror::new(&*store).snapshot().await.unwrap();
        let pr = snapshot.pr(&project(), 7).await.unwrap().unwrap();
        assert!(pr.title.starts_with("Bad title: "), "got {:?}", pr.title);
    }

    #[tokio::test]
    async fn test_set_state_round_trips() {
        let store = MemoryStore::new();
        seed(&store, &[("foo/bar/pr/7/head", &format!("{HASH_A}\n"))]).await;

        let mirror = Mirror::new(&*store);
        let ci = TreePath::parse("ci/unit").unwrap();
        let commit = CommitHash::new(HASH_A).unwrap();
        mirror
            .set_state(
                &project(),
                &commit,
                &ci,
                StatusState::Success,
                "all green",
                Some("http://ci/pr/foo/bar/7"),
                "Set state of PR#7: unit = success",
            )
            .await
            .unwrap();

        let snapshot = mirror.snapshot().await.unwrap();
        let status = snapshot.commit_state(&project(), &commit, &ci).await.unwrap();
        assert_eq!(status.state, Some(StatusState::Success));
        assert_eq!(status.description.as_deref(), Some("all green"));
        assert_eq!(status.target_url.as_deref(), Some("http://ci/pr/foo/bar/7"));

        // Clearing the URL removes the leaf.
        mirror
            .set_state(
                &project(),
                &commit,
                &ci,
                StatusState::Failure,
                "broke",
                None,
                "Set state of PR#7: unit = failure",
            )
            .await
            .unwrap();
        let status = mirror
            .snapshot()
            .await
            .unwrap()
            .commit_state(&project(), &commit, &ci)
            .await
            .unwrap();
        assert_eq!(status.state, Some(StatusState::Failure));
        assert_eq!(status.target_url, None);
    }

    #[tokio::test]
    async fn test_enable_monitoring_is_idempotent() {
        let store = MemoryStore::new();
        seed(&store, &[("seed/seed/.keep", "")]).await;
        let mirror = Mirror::new(&*store);
        let projects = vec![project()];

        mirror.enable_monitoring(&projects).await.unwrap();
        let first = store
            .branch(METADATA_BRANCH)
            .head()
            .await
            .unwrap()
            .unwrap()
            .id()
            .clone();

        // Second call adds nothing and must not commit.
        mirror.enable_monitoring(&projects).await.unwrap();
        let second = store
            .branch(METADATA_BRANCH)
            .head()
            .await
            .unwrap()
            .unwrap()
            .id()
            .clone();
        assert_eq!(first, second);

        let tree = store
            .branch(METADATA_BRANCH)
            .head()
            .await
            .unwrap()
            .unwrap()
            .tree();
        assert!(tree
            .exists_file(&TreePath::parse("foo/bar/.monitor").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_monitor_delivers_snapshots_until_cancelled() {
        let store = MemoryStore::new();
        seed(&store, &[("foo/bar/pr/7/head", &format!("{HASH_A}\n"))]).await;

        let mirror = Mirror::new(&*store);
        let cancel = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let monitor = {
            let mirror = mirror.clone();
            let cancel = cancel.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                mirror
                    .monitor::<_, _, MirrorError>(
                        |snapshot| {
                            let seen = seen.clone();
                            async move {
                                seen.lock().unwrap().push(snapshot.commit_id().clone());
                                Ok(())
                            }
                        },
                        &cancel,
                    )
                    .await
            })
        };

        // Wait for the first delivery, then push a second commit.
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        seed(&store, &[("foo/bar/pr/7/head", &format!("{HASH_B}\n"))]).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        let result = monitor.await.unwrap();
        assert!(matches!(result, Err(MirrorError::Aborted)));
    }

    #[tokio::test]
    async fn test_commit_state_absent_is_all_none() {
        let store = MemoryStore::new();
        seed(&store, &[("foo/bar/.monitor", "")]).await;
        let snapshot = Mirror::new(&*store).snapshot().await.unwrap();
        let status = snapshot
            .commit_state(
                &project(),
                &CommitHash::new(HASH_A).unwrap(),
                &TreePath::parse("unit").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status, CommitStatus::default());
    }
}
