//! Declarative pipeline terms and their evaluator.
//!
//! A term is a pure description of a computation over a snapshot and the
//! build cache: value leaves, snapshot observers, fan-in combinators and
//! memoized `build` nodes. Terms form a DAG: sharing a [`Term`] value
//! shares the node, and the evaluator computes every node at most once
//! per run.
//!
//! Evaluation never raises: every failure, including panics inside the
//! run, is folded into a `failure` result with an explanatory
//! description. Cancellation propagates through a shared token checked
//! at each node.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::cache::BuildCache;
use crate::cache::BuildInput;
use crate::cache::CacheLookup;
use crate::cache::LogTree;
use crate::cache::Recipe;
use crate::mirror::Snapshot;
use crate::mirror::StatusState;
use crate::path::CommitHash;
use crate::path::TargetId;
use crate::path::TargetKind;

/// A job: one named pipeline attached to one target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId {
    /// The target the pipeline is attached to.
    pub target: TargetId,
    /// Pipeline name within the target.
    pub name: String,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target, self.name)
    }
}

enum TermNode {
    Const { value: String },
    Fail { message: String },
    Pending { reason: String },
    Head,
    Title,
    Build { recipe: Arc<dyn Recipe> },
    All { children: Vec<Term> },
    Pair { left: Term, right: Term },
}

/// A node in the pipeline DAG. Cloning shares the node.
#[derive(Clone)]
pub struct Term {
    node: Arc<TermNode>,
}

impl Term {
    fn new(node: TermNode) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// A constant success with the given description.
    pub fn value(value: impl Into<String>) -> Self {
        Self::new(TermNode::Const {
            value: value.into(),
        })
    }

    /// A constant failure.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(TermNode::Fail {
            message: message.into(),
        })
    }

    /// A term that is not ready yet.
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::new(TermNode::Pending {
            reason: reason.into(),
        })
    }

    /// The target's head commit hash.
    pub fn head() -> Self {
        Self::new(TermNode::Head)
    }

    /// The target's title (PR title, or the ref name).
    pub fn title() -> Self {
        Self::new(TermNode::Title)
    }

    /// A memoized build keyed by the target's head commit.
    pub fn build(recipe: Arc<dyn Recipe>) -> Self {
        Self::new(TermNode::Build { recipe })
    }

    /// All children must succeed.
    pub fn all(children: Vec<Term>) -> Self {
        Self::new(TermNode::All { children })
    }

    /// Both sides must succeed.
    pub fn pair(left: Term, right: Term) -> Self {
        Self::new(TermNode::Pair { left, right })
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.node) as *const () as usize
    }
}

/// Final product of one evaluation.
#[derive(Clone)]
pub struct Evaluation {
    /// `success`, `pending` or `failure`.
    pub status: StatusState,
    /// Human-readable description.
    pub description: String,
    /// Where the logs are.
    pub log: LogTree,
}

impl Evaluation {
    fn success(description: impl Into<String>, log: LogTree) -> Self {
        Self {
            status: StatusState::Success,
            description: description.into(),
            log,
        }
    }

    fn pending(description: impl Into<String>, log: LogTree) -> Self {
        Self {
            status: StatusState::Pending,
            description: description.into(),
            log,
        }
    }

    /// A failure evaluation; also used for captured panics.
    pub fn failure(description: impl Into<String>, log: LogTree) -> Self {
        Self {
            status: StatusState::Failure,
            description: description.into(),
            log,
        }
    }
}

/// Engine-supplied callback scheduling one recomputation of the job.
pub type RecalcFn = Arc<dyn Fn() + Send + Sync>;

struct RunState {
    cache: Arc<BuildCache>,
    snapshot: Snapshot,
    job: JobId,
    recalc: RecalcFn,
    // Set once the first completed dependency has scheduled a
    // recomputation; later completions of this run stay quiet.
    recalc_armed: AtomicBool,
    cancel: CancellationToken,
    memo: Mutex<HashMap<usize, Evaluation>>,
}

impl RunState {
    /// The job's target as seen by this run's snapshot.
    async fn target(&self) -> Result<(CommitHash, String), String> {
        let project = self
            .snapshot
            .project(&self.job.target.project)
            .await
            .map_err(|err| err.to_string())?;
        match &self.job.target.kind {
            TargetKind::Pr(number) => match project.prs.get(number) {
                Some(pr) => Ok((pr.head.clone(), pr.title.clone())),
                None => Err(format!("PR#{number} is no longer open")),
            },
            TargetKind::Ref(name) => match project.refs.get(name) {
                Some(r) => Ok((r.head.clone(), name.to_string())),
                None => Err(format!("ref {name} is gone")),
            },
        }
    }
}

/// Runs terms against snapshots and the build cache.
#[derive(Clone)]
pub struct Evaluator {
    cache: Arc<BuildCache>,
}

impl Evaluator {
    /// Create an evaluator over `cache`.
    pub fn new(cache: Arc<BuildCache>) -> Self {
        Self { cache }
    }

    /// Start one evaluation of `term` for `job`.
    ///
    /// The returned future resolves to the final evaluation; the token
    /// cancels every sub-computation of this run and is idempotent.
    /// `recalc` is invoked (at most once per run) when a dependency that
    /// left this run `pending` completes asynchronously.
    pub fn run(
        &self,
        snapshot: Snapshot,
        job: JobId,
        recalc: RecalcFn,
        term: Term,
    ) -> (BoxFuture<'static, Evaluation>, CancellationToken) {
        let cancel = CancellationToken::new();
        let state = Arc::new(RunState {
            cache: self.cache.clone(),
            snapshot,
            job,
            recalc,
            recalc_armed: AtomicBool::new(false),
            cancel: cancel.clone(),
            memo: Mutex::new(HashMap::new()),
        });

        let run_cancel = cancel.clone();
        let future = async move {
            let job = state.job.clone();
            let task = tokio::spawn(eval(state, term));
            tokio::select! {
                _ = run_cancel.cancelled() => Evaluation::failure("evaluation cancelled", LogTree::Empty),
                joined = task => match joined {
                    Ok(evaluation) => evaluation,
                    Err(err) => {
                        warn!(job = %job, error = %err, "evaluation panicked");
                        Evaluation::failure(format!("evaluation failed: {err}"), LogTree::Empty)
                    }
                },
            }
        }
        .boxed();

        (future, cancel)
    }
}

fn eval(state: Arc<RunState>, term: Term) -> BoxFuture<'static, Evaluation> {
    Box::pin(async move {
        if state.cancel.is_cancelled() {
            return Evaluation::failure("evaluation cancelled", LogTree::Empty);
        }

        let key = term.key();
        if let Some(cached) = state.memo.lock().await.get(&key) {
            return cached.clone();
        }

        let evaluation = match &*term.node {
            TermNode::Const { value } => Evaluation::success(value.clone(), LogTree::Empty),
            TermNode::Fail { message } => Evaluation::failure(message.clone(), LogTree::Empty),
            TermNode::Pending { reason } => Evaluation::pending(reason.clone(), LogTree::Empty),
            TermNode::Head => match state.target().await {
                Ok((head, _)) => Evaluation::success(head.to_string(), LogTree::Empty),
                Err(message) => Evaluation::failure(message, LogTree::Empty),
            },
            TermNode::Title => match state.target().await {
                Ok((_, title)) => Evaluation::success(title, LogTree::Empty),
                Err(message) => Evaluation::failure(message, LogTree::Empty),
            },
            TermNode::Build { recipe } => eval_build(&state, recipe.clone()).await,
            TermNode::All { children } => {
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    parts.push(eval(state.clone(), child.clone()).await);
                }
                combine(parts)
            }
            TermNode::Pair { left, right } => {
                let left = eval(state.clone(), left.clone()).await;
                let right = eval(state.clone(), right.clone()).await;
                combine(vec![left, right])
            }
        };

        state.memo.lock().await.insert(key, evaluation.clone());
        evaluation
    })
}

async fn eval_build(state: &Arc<RunState>, recipe: Arc<dyn Recipe>) -> Evaluation {
    let (head, _) = match state.target().await {
        Ok(target) => target,
        Err(message) => return Evaluation::failure(message, LogTree::Empty),
    };
    let label = recipe.label().to_string();
    let lookup = state
        .cache
        .demand(recipe, BuildInput { commit: head })
        .await;
    match lookup {
        Err(err) => Evaluation::failure(err.to_string(), LogTree::Empty),
        Ok(CacheLookup::Done { outcome, log }) => match outcome.as_result() {
            Ok(message) => Evaluation::success(message, log),
            Err(message) => Evaluation::failure(message, log),
        },
        Ok(CacheLookup::InFlight { wait, log }) => {
            // Wake the engine once, when the dependency resolves.
            let waiter_state = state.clone();
            tokio::spawn(async move {
                let _ = wait.await;
                if waiter_state.cancel.is_cancelled() {
                    return;
                }
                if !waiter_state.recalc_armed.swap(true, Ordering::AcqRel) {
                    debug!(job = %waiter_state.job, "dependency resolved, scheduling recomputation");
                    (waiter_state.recalc)();
                }
            });
            Evaluation::pending(format!("{label} in progress"), log)
        }
    }
}

/// Fan-in: failure dominates, then pending; descriptions of successful
/// parts are joined.
fn combine(parts: Vec<Evaluation>) -> Evaluation {
    let mut log = LogTree::Empty;
    let mut pending: Option<String> = None;
    let mut failed: Option<String> = None;
    let mut descriptions = Vec::new();
    for part in parts {
        log = LogTree::pair(log, part.log);
        match part.status {
            StatusState::Success => descriptions.push(part.description),
            StatusState::Pending => {
                pending.get_or_insert(part.description);
            }
            StatusState::Failure | StatusState::Error => {
                failed.get_or_insert(part.description);
            }
        }
    }
    if let Some(message) = failed {
        Evaluation::failure(message, log)
    } else if let Some(reason) = pending {
        Evaluation::pending(reason, log)
    } else {
        Evaluation::success(descriptions.join("; "), log)
    }
}
