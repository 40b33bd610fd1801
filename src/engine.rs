//! The engine loop.
//!
//! One engine instance watches the metadata mirror and keeps an
//! in-memory set of targets (open PRs and refs) per monitored project.
//! On every snapshot it diffs that set, creates and cancels jobs, and
//! recalculates every job under the global term lock, publishing commit
//! statuses back through the mirror when the published triple changed.
//!
//! # Supervision
//!
//! The store connection is owned by a pending-or-ready slot: `db()`
//! resolves the current connection, `reconnect()` replaces it with a new
//! pending connect (idempotent while one is pending). `auto_restart`
//! classifies task failures by probing the `master` branch: if the probe
//! succeeds the failure was unrelated to the store and propagates;
//! otherwise the engine reconnects and retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cache::BuildCache;
use crate::cache::LogTree;
use crate::cache::RebuildTrigger;
use crate::config::EngineConfig;
use crate::constants::PROBE_BRANCH;
use crate::error::EngineError;
use crate::error::Result;
use crate::error::UnknownBuildSnafu;
use crate::logs::LiveLogs;
use crate::mirror::ForgeRef;
use crate::mirror::Mirror;
use crate::mirror::PullRequest;
use crate::mirror::Snapshot;
use crate::mirror::StatusState;
use crate::path::CommitHash;
use crate::path::ProjectId;
use crate::path::TargetId;
use crate::path::TargetKind;
use crate::path::TreePath;
use crate::store::TreeStore;
use crate::term::Evaluator;
use crate::term::JobId;
use crate::term::Term;

/// The last triple published to the forge for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Target head the status was published against.
    pub hash: CommitHash,
    /// Published state.
    pub status: StatusState,
    /// Published description.
    pub description: String,
}

/// Current result of a job as shown by the web layer.
#[derive(Clone)]
pub struct JobOutput {
    /// Evaluation status.
    pub status: StatusState,
    /// Evaluation description.
    pub description: String,
    /// Where the logs are.
    pub log: LogTree,
}

impl Default for JobOutput {
    fn default() -> Self {
        Self {
            status: StatusState::Pending,
            description: "never evaluated".to_string(),
            log: LogTree::Empty,
        }
    }
}

/// A named pipeline attached to one target.
pub struct JobState {
    id: JobId,
    term: Term,
    ci_context: TreePath,
    cancel: StdMutex<Option<CancellationToken>>,
    published: StdMutex<Option<Published>>,
    output: StdMutex<JobOutput>,
}

impl JobState {
    /// Job identity.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Latest evaluation result.
    pub fn output(&self) -> JobOutput {
        self.output.lock().expect("job output poisoned").clone()
    }

    /// Last published triple, if any.
    pub fn published(&self) -> Option<Published> {
        self.published.lock().expect("job state poisoned").clone()
    }

    /// Cancel the current evaluation, if one is registered.
    fn cancel_current(&self) {
        if let Some(token) = self.cancel.lock().expect("job state poisoned").take() {
            token.cancel();
        }
    }

    fn set_cancel(&self, token: CancellationToken) {
        let previous = self
            .cancel
            .lock()
            .expect("job state poisoned")
            .replace(token);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

/// A PR or ref currently tracked by the engine.
///
/// Identity is stable across snapshots: head and title are swapped in
/// place while jobs and their published state are retained.
pub struct TargetState {
    id: TargetId,
    head: StdRwLock<CommitHash>,
    title: StdRwLock<String>,
    jobs: Vec<Arc<JobState>>,
}

impl TargetState {
    fn new(id: TargetId, head: CommitHash, title: String, pipelines: &crate::config::PipelineFactory) -> Arc<Self> {
        let mut jobs = Vec::new();
        for (name, term) in pipelines(&id.kind) {
            let ci_context = match TreePath::parse(&name) {
                Ok(path) => path,
                Err(err) => {
                    warn!(target_id = %id, job = %name, error = %err, "skipping job with invalid name");
                    continue;
                }
            };
            jobs.push(Arc::new(JobState {
                id: JobId {
                    target: id.clone(),
                    name,
                },
                term,
                ci_context,
                cancel: StdMutex::new(None),
                published: StdMutex::new(None),
                output: StdMutex::new(JobOutput::default()),
            }));
        }
        Arc::new(Self {
            id,
            head: StdRwLock::new(head),
            title: StdRwLock::new(title),
            jobs,
        })
    }

    /// Target identity.
    pub fn id(&self) -> &TargetId {
        &self.id
    }

    /// Current head commit.
    pub fn head(&self) -> CommitHash {
        self.head.read().expect("target state poisoned").clone()
    }

    /// Current title (PR title, or the ref name).
    pub fn title(&self) -> String {
        self.title.read().expect("target state poisoned").clone()
    }

    /// Jobs attached to this target.
    pub fn jobs(&self) -> &[Arc<JobState>] {
        &self.jobs
    }

    fn update(&self, head: CommitHash, title: String) {
        *self.head.write().expect("target state poisoned") = head;
        *self.title.write().expect("target state poisoned") = title;
    }

    fn cancel_jobs(&self) {
        for job in &self.jobs {
            job.cancel_current();
        }
    }

    /// Human-readable form used in metadata commit messages.
    fn dump(&self) -> String {
        match &self.id.kind {
            TargetKind::Pr(number) => format!(
                "PR#{number} (commit={};title={})",
                self.head().short(),
                self.title()
            ),
            TargetKind::Ref(name) => {
                format!("Ref {name} (commit={})", self.head().short())
            }
        }
    }
}

/// The targets of one project, swapped atomically per snapshot.
#[derive(Default)]
pub struct ProjectTracker {
    /// Open PRs by number.
    pub prs: BTreeMap<u64, Arc<TargetState>>,
    /// Refs by name.
    pub refs: BTreeMap<TreePath, Arc<TargetState>>,
}

impl ProjectTracker {
    /// All targets, PRs first.
    pub fn targets(&self) -> impl Iterator<Item = &Arc<TargetState>> {
        self.prs.values().chain(self.refs.values())
    }
}

/// One established store connection and the services built on it.
pub struct Db {
    /// The store itself.
    pub store: Arc<dyn TreeStore>,
    /// Metadata mirror.
    pub mirror: Mirror,
    /// Build cache.
    pub cache: Arc<BuildCache>,
    /// Term evaluator.
    pub evaluator: Evaluator,
}

type ConnectFuture = Shared<BoxFuture<'static, Arc<Db>>>;

enum DbState {
    Empty,
    Connecting(ConnectFuture),
    Ready(Arc<Db>),
}

struct DbSlot {
    generation: u64,
    state: DbState,
}

struct EngineInner {
    config: EngineConfig,
    logs: Arc<LiveLogs>,
    term_lock: Mutex<()>,
    db: Mutex<DbSlot>,
    projects: StdRwLock<BTreeMap<ProjectId, Arc<ProjectTracker>>>,
    cancel: CancellationToken,
}

/// The CI evaluation engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine; nothing runs until [`Engine::run`].
    pub fn new(config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                logs: LiveLogs::new(),
                term_lock: Mutex::new(()),
                db: Mutex::new(DbSlot {
                    generation: 0,
                    state: DbState::Empty,
                }),
                projects: StdRwLock::new(BTreeMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Stop the engine: the monitor and all supervisors wind down.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// The engine's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    fn connect(&self) -> ConnectFuture {
        let inner = self.inner.clone();
        async move {
            loop {
                match (inner.config.connector)().await {
                    Ok(store) => {
                        let mirror = Mirror::new(&*store);
                        let cache = BuildCache::new(store.clone(), inner.logs.clone());
                        let evaluator = Evaluator::new(cache.clone());
                        info!("connected to store");
                        return Arc::new(Db {
                            store,
                            mirror,
                            cache,
                            evaluator,
                        });
                    }
                    Err(err) => {
                        warn!(
                            error = %err,
                            backoff_secs = inner.config.reconnect_backoff.as_secs(),
                            "store connection failed, backing off"
                        );
                        tokio::time::sleep(inner.config.reconnect_backoff).await;
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    /// The current store connection, connecting if necessary.
    pub async fn db(&self) -> Arc<Db> {
        let (future, generation) = {
            let mut slot = self.inner.db.lock().await;
            match &slot.state {
                DbState::Ready(db) => return db.clone(),
                DbState::Connecting(future) => (future.clone(), slot.generation),
                DbState::Empty => {
                    let future = self.connect();
                    slot.state = DbState::Connecting(future.clone());
                    (future, slot.generation)
                }
            }
        };
        let db = future.await;
        let mut slot = self.inner.db.lock().await;
        // A reconnect may have replaced the slot while we waited; only
        // promote the connection we actually awaited.
        if slot.generation == generation {
            slot.state = DbState::Ready(db.clone());
        }
        db
    }

    /// Replace the connection with a new pending connect. Idempotent
    /// while a connect is already pending.
    pub async fn reconnect(&self) {
        let mut slot = self.inner.db.lock().await;
        if matches!(slot.state, DbState::Connecting(_)) {
            return;
        }
        slot.generation += 1;
        slot.state = DbState::Connecting(self.connect());
        info!("store connection replaced, reconnect pending");
    }

    /// Run `f` against the current connection, reconnecting when the
    /// store itself is at fault.
    async fn auto_restart<T, F>(&self, label: &str, mut f: F) -> Result<T>
    where
        F: FnMut(Arc<Db>) -> BoxFuture<'static, Result<T>>,
    {
        loop {
            let db = self.db().await;
            match f(db.clone()).await {
                Ok(value) => return Ok(value),
                Err(_) if self.inner.cancel.is_cancelled() => return Err(EngineError::Aborted),
                Err(err) => {
                    // Probe the store: a healthy store means the failure
                    // was the task's own and must propagate.
                    match db.store.branch(PROBE_BRANCH).head().await {
                        Ok(_) => return Err(err),
                        Err(probe) => {
                            warn!(
                                task = label,
                                error = %err,
                                probe = %probe,
                                "store unreachable, reconnecting"
                            );
                            self.reconnect().await;
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run the engine until [`Engine::shutdown`].
    ///
    /// Enables monitoring for every configured project, then processes
    /// each metadata snapshot as it arrives.
    pub async fn run(&self) -> Result<()> {
        let engine = self.clone();
        let result = self
            .auto_restart("monitor", move |db| {
                let engine = engine.clone();
                async move {
                    let projects: Vec<ProjectId> =
                        engine.inner.config.projects.keys().cloned().collect();
                    db.mirror.enable_monitoring(&projects).await?;
                    let cancel = engine.inner.cancel.clone();
                    let monitor_db = db.clone();
                    db.mirror
                        .monitor(
                            move |snapshot| {
                                let engine = engine.clone();
                                let db = monitor_db.clone();
                                async move { engine.process_snapshot(&db, snapshot).await }
                            },
                            &cancel,
                        )
                        .await
                }
                .boxed()
            })
            .await;
        match result {
            Err(EngineError::Aborted) => {
                info!("engine stopped");
                Ok(())
            }
            other => other,
        }
    }

    async fn process_snapshot(&self, db: &Arc<Db>, snapshot: Snapshot) -> Result<()> {
        // The term lock covers target-map mutation and every
        // recalculation of this snapshot.
        let _guard = self.inner.term_lock.lock().await;
        debug!(commit = %snapshot.commit_id(), "processing snapshot");

        if let Some(canaries) = &self.inner.config.canaries {
            for project in canaries.keys() {
                if !self.inner.config.projects.contains_key(project) {
                    warn!(project = %project, "canary set names an unmonitored project");
                }
            }
        }

        let mut work: Vec<(Arc<TargetState>, Arc<JobState>)> = Vec::new();
        for (project_id, pipelines) in &self.inner.config.projects {
            let observed = snapshot.project(project_id).await?;
            let canary = self
                .inner
                .config
                .canaries
                .as_ref()
                .and_then(|map| map.get(project_id));

            let previous = self
                .inner
                .projects
                .read()
                .expect("project map poisoned")
                .get(project_id)
                .cloned()
                .unwrap_or_default();

            let mut prs = BTreeMap::new();
            for (number, pr) in &observed.prs {
                let kind = TargetKind::Pr(*number);
                if canary.is_some_and(|set| !set.contains(&kind)) {
                    debug!(project = %project_id, target_id = %kind, "dropping non-canary target");
                    continue;
                }
                let target = match previous.prs.get(number) {
                    Some(existing) => {
                        existing.update(pr.head.clone(), pr.title.clone());
                        existing.clone()
                    }
                    None => self.new_pr_target(project_id, pr, pipelines),
                };
                prs.insert(*number, target);
            }
            for (number, target) in &previous.prs {
                if !prs.contains_key(number) {
                    info!(target_id = %target.id(), "PR closed, cancelling jobs");
                    target.cancel_jobs();
                }
            }

            let mut refs = BTreeMap::new();
            for (name, forge_ref) in &observed.refs {
                let kind = TargetKind::Ref(name.clone());
                if canary.is_some_and(|set| !set.contains(&kind)) {
                    debug!(project = %project_id, target_id = %kind, "dropping non-canary target");
                    continue;
                }
                let target = match previous.refs.get(name) {
                    Some(existing) => {
                        existing.update(forge_ref.head.clone(), name.to_string());
                        existing.clone()
                    }
                    None => self.new_ref_target(project_id, forge_ref, pipelines),
                };
                refs.insert(name.clone(), target);
            }
            for (name, target) in &previous.refs {
                if !refs.contains_key(name) {
                    info!(target_id = %target.id(), "ref gone, cancelling jobs");
                    target.cancel_jobs();
                }
            }

            let tracker = Arc::new(ProjectTracker { prs, refs });
            for target in tracker.targets() {
                for job in target.jobs() {
                    work.push((target.clone(), job.clone()));
                }
            }
            self.inner
                .projects
                .write()
                .expect("project map poisoned")
                .insert(project_id.clone(), tracker);
        }

        for (target, job) in work {
            self.recalculate_locked(db, &snapshot, &target, &job).await?;
        }
        Ok(())
    }

    fn new_pr_target(
        &self,
        project: &ProjectId,
        pr: &PullRequest,
        pipelines: &crate::config::PipelineFactory,
    ) -> Arc<TargetState> {
        let id = TargetId {
            project: project.clone(),
            kind: TargetKind::Pr(pr.number),
        };
        info!(target_id = %id, title = %pr.title, "target appeared");
        TargetState::new(id, pr.head.clone(), pr.title.clone(), pipelines)
    }

    fn new_ref_target(
        &self,
        project: &ProjectId,
        forge_ref: &ForgeRef,
        pipelines: &crate::config::PipelineFactory,
    ) -> Arc<TargetState> {
        let id = TargetId {
            project: project.clone(),
            kind: TargetKind::Ref(forge_ref.name.clone()),
        };
        info!(target_id = %id, "target appeared");
        TargetState::new(
            id,
            forge_ref.head.clone(),
            forge_ref.name.to_string(),
            pipelines,
        )
    }

    // ========================================================================
    // Recalculation
    // ========================================================================

    /// Evaluate one job and publish its status. Caller holds the term
    /// lock.
    async fn recalculate_locked(
        &self,
        db: &Arc<Db>,
        snapshot: &Snapshot,
        target: &Arc<TargetState>,
        job: &Arc<JobState>,
    ) -> Result<()> {
        job.cancel_current();

        let recalc = self.recalc_callback(target, job);
        let (future, cancel) =
            db.evaluator
                .run(snapshot.clone(), job.id.clone(), recalc, job.term.clone());
        job.set_cancel(cancel);
        let evaluation = future.await;

        // The triple is compared against the explicitly stored previous
        // publication; the target head may already have moved on.
        let hash = target.head();
        let unchanged = job.published().is_some_and(|p| {
            p.hash == hash && p.status == evaluation.status && p.description == evaluation.description
        });
        if unchanged {
            debug!(job = %job.id, "publication suppressed, triple unchanged");
        } else {
            let message = format!(
                "Set state of {}: {} = {}",
                target.dump(),
                job.id.name,
                evaluation.status
            );
            let url = self.inner.config.target_url(&target.id);
            db.mirror
                .set_state(
                    &target.id.project,
                    &hash,
                    &job.ci_context,
                    evaluation.status,
                    &evaluation.description,
                    Some(&url),
                    &message,
                )
                .await?;
            *job.published.lock().expect("job state poisoned") = Some(Published {
                hash,
                status: evaluation.status,
                description: evaluation.description.clone(),
            });
        }

        *job.output.lock().expect("job output poisoned") = JobOutput {
            status: evaluation.status,
            description: evaluation.description,
            log: evaluation.log,
        };
        Ok(())
    }

    /// Build the evaluator's recalc callback: schedules one
    /// term-lock-guarded re-snapshot-and-recalculate of this job.
    fn recalc_callback(&self, target: &Arc<TargetState>, job: &Arc<JobState>) -> crate::term::RecalcFn {
        let engine = self.clone();
        let target = Arc::downgrade(target);
        let job = Arc::downgrade(job);
        Arc::new(move || {
            let engine = engine.clone();
            let target = target.clone();
            let job = job.clone();
            tokio::spawn(async move {
                let (Some(target), Some(job)) = (target.upgrade(), job.upgrade()) else {
                    return;
                };
                if let Err(err) = engine.recalculate_task(target, job).await {
                    warn!(error = %err, "scheduled recalculation failed");
                }
            });
        })
    }

    async fn recalculate_task(&self, target: Arc<TargetState>, job: Arc<JobState>) -> Result<()> {
        let db = self.db().await;
        let _guard = self.inner.term_lock.lock().await;
        if !self.is_tracked(&target) {
            debug!(target_id = %target.id(), "target gone, dropping scheduled recalculation");
            return Ok(());
        }
        let snapshot = db.mirror.snapshot().await?;
        self.recalculate_locked(&db, &snapshot, &target, &job).await
    }

    fn is_tracked(&self, target: &Arc<TargetState>) -> bool {
        let projects = self.inner.projects.read().expect("project map poisoned");
        let Some(tracker) = projects.get(&target.id.project) else {
            return false;
        };
        match &target.id.kind {
            TargetKind::Pr(number) => tracker
                .prs
                .get(number)
                .is_some_and(|t| Arc::ptr_eq(t, target)),
            TargetKind::Ref(name) => tracker
                .refs
                .get(name)
                .is_some_and(|t| Arc::ptr_eq(t, target)),
        }
    }

    // ========================================================================
    // Rebuild and cancel routers
    // ========================================================================

    /// Invalidate every saved log on `branch` and recalculate the jobs
    /// referencing it.
    ///
    /// Fails (leaving all state untouched) when no job's log tree
    /// references the branch.
    pub async fn rebuild(&self, branch: &str) -> Result<()> {
        let mut triggers: Vec<RebuildTrigger> = Vec::new();
        let mut jobs: Vec<(Arc<TargetState>, Arc<JobState>)> = Vec::new();
        {
            let projects = self.inner.projects.read().expect("project map poisoned");
            for tracker in projects.values() {
                for target in tracker.targets() {
                    for job in target.jobs() {
                        if collect_triggers(&job.output().log, branch, &mut triggers) {
                            jobs.push((target.clone(), job.clone()));
                        }
                    }
                }
            }
        }
        if jobs.is_empty() {
            return UnknownBuildSnafu { branch }.fail();
        }
        info!(branch, jobs = jobs.len(), "rebuilding");

        let results = futures::future::join_all(triggers.iter().map(|t| t.force())).await;
        for result in results {
            result?;
        }

        let db = self.db().await;
        let _guard = self.inner.term_lock.lock().await;
        let snapshot = db.mirror.snapshot().await?;
        for (target, job) in jobs {
            self.recalculate_locked(&db, &snapshot, &target, &job).await?;
        }
        Ok(())
    }

    /// Cancel the live build attached to `branch`.
    pub fn cancel_build(&self, branch: &str) -> Result<()> {
        self.inner.logs.cancel(branch).map_err(Into::into)
    }

    // ========================================================================
    // Read API (web layer)
    // ========================================================================

    /// Current in-memory view of every monitored project.
    pub fn projects(&self) -> BTreeMap<ProjectId, Arc<ProjectTracker>> {
        self.inner
            .projects
            .read()
            .expect("project map poisoned")
            .clone()
    }

    /// The tracked state of one target, if present.
    pub fn target(&self, id: &TargetId) -> Option<Arc<TargetState>> {
        let projects = self.inner.projects.read().expect("project map poisoned");
        let tracker = projects.get(&id.project)?;
        match &id.kind {
            TargetKind::Pr(number) => tracker.prs.get(number).cloned(),
            TargetKind::Ref(name) => tracker.refs.get(name).cloned(),
        }
    }

    /// Jobs of one target.
    pub fn jobs(&self, id: &TargetId) -> Vec<Arc<JobState>> {
        self.target(id)
            .map(|target| target.jobs().to_vec())
            .unwrap_or_default()
    }

    /// Current result of one job.
    pub fn job_state(&self, job: &JobState) -> JobOutput {
        job.output()
    }

    /// Title of one target.
    pub fn title(&self, id: &TargetId) -> Option<String> {
        self.target(id).map(|target| target.title())
    }

    /// The store handle, for serving saved logs directly.
    pub async fn store(&self) -> Arc<dyn TreeStore> {
        self.db().await.store.clone()
    }
}

/// Collect unforced rebuild triggers matching `branch`. Returns whether
/// any node matched.
fn collect_triggers(log: &LogTree, branch: &str, out: &mut Vec<RebuildTrigger>) -> bool {
    match log {
        LogTree::Saved {
            branch: saved,
            rebuild,
            ..
        } if saved.as_str() == branch => {
            if !rebuild.is_forced() {
                out.push(rebuild.clone());
            }
            true
        }
        LogTree::Pair { left, right } => {
            // Recurse both sides; either match marks the job.
            let left = collect_triggers(left, branch, out);
            let right = collect_triggers(right, branch, out);
            left || right
        }
        LogTree::Saved { .. } | LogTree::Live { .. } | LogTree::Empty => false,
    }
}
