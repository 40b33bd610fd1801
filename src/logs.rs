//! In-memory live logs for in-progress builds.
//!
//! Each running build owns one live log, registered under the store
//! branch its result will be committed to. Consumers stream the log:
//! the buffered prefix is delivered immediately, later appends arrive as
//! bounded-channel chunks. Producers block when a subscriber's channel
//! is full; frames are never dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use snafu::Snafu;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::LOG_CHANNEL_CAPACITY;

/// Result type for log-registry operations.
pub type Result<T, E = LogError> = std::result::Result<T, E>;

/// Live-log registry failures.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum LogError {
    /// A live log is already registered for this branch.
    #[snafu(display("a build is already running for {branch}"))]
    AlreadyRunning {
        /// Branch name.
        branch: String,
    },

    /// No live log is registered for this branch.
    #[snafu(display("no build is running for {branch}"))]
    NoActiveBuild {
        /// Branch name.
        branch: String,
    },

    /// The build exists but was registered without a cancellation
    /// handle.
    #[snafu(display("the build on {branch} cannot be cancelled"))]
    NotCancellable {
        /// Branch name.
        branch: String,
    },
}

#[derive(Debug)]
struct LogInner {
    buffer: String,
    subscribers: Vec<mpsc::Sender<String>>,
    closed: bool,
}

/// An append-only character stream for one in-progress build.
#[derive(Debug)]
pub struct LiveLog {
    branch: String,
    // Absent for computations that cannot be stopped once started.
    cancel: Option<CancellationToken>,
    inner: Mutex<LogInner>,
}

impl LiveLog {
    /// The store branch this log belongs to.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Token cancelling the computation this log records, if it has one.
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Append `data`, pushing it to every active stream.
    ///
    /// Blocks while any subscriber's channel is full; a closed
    /// subscriber is dropped.
    pub async fn append(&self, data: &str) {
        let senders = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.buffer.push_str(data);
            inner.subscribers.clone()
        };
        let mut dead = false;
        for sender in &senders {
            if sender.send(data.to_string()).await.is_err() {
                dead = true;
            }
        }
        if dead {
            let mut inner = self.inner.lock().await;
            inner.subscribers.retain(|s| !s.is_closed());
        }
    }

    /// Start streaming: the buffered prefix plus, while the log is
    /// open, a channel of subsequent chunks. A `None` receiver means
    /// the log was already closed and the prefix is complete.
    pub async fn stream(&self) -> (String, Option<mpsc::Receiver<String>>) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return (inner.buffer.clone(), None);
        }
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        inner.subscribers.push(tx);
        (inner.buffer.clone(), Some(rx))
    }

    /// Full contents written so far.
    pub async fn contents(&self) -> String {
        self.inner.lock().await.buffer.clone()
    }

    /// Signal the associated computation to stop.
    ///
    /// Fails with [`LogError::NotCancellable`] when the build was
    /// registered without a cancellation handle.
    pub fn request_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => NotCancellableSnafu {
                branch: self.branch.clone(),
            }
            .fail(),
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        // Dropping the senders terminates every pending stream.
        inner.subscribers.clear();
    }
}

/// Registry of live logs, keyed by store branch name.
///
/// At most one live log per branch at a time; coincident demands for
/// the same build share the registered log.
#[derive(Default)]
pub struct LiveLogs {
    inner: StdMutex<HashMap<String, Arc<LiveLog>>>,
}

impl LiveLogs {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new live log for `branch`. A build registered with
    /// `None` cannot be cancelled through the registry.
    pub fn create(&self, branch: &str, cancel: Option<CancellationToken>) -> Result<Arc<LiveLog>> {
        let mut logs = self.inner.lock().expect("log registry poisoned");
        if logs.contains_key(branch) {
            return AlreadyRunningSnafu { branch }.fail();
        }
        let log = Arc::new(LiveLog {
            branch: branch.to_string(),
            cancel,
            inner: Mutex::new(LogInner {
                buffer: String::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        });
        logs.insert(branch.to_string(), log.clone());
        debug!(branch, "registered live log");
        Ok(log)
    }

    /// The live log for `branch`, if a build is running.
    pub fn lookup(&self, branch: &str) -> Option<Arc<LiveLog>> {
        self.inner.lock().expect("log registry poisoned").get(branch).cloned()
    }

    /// Drop the registration and end all pending streams.
    pub async fn close(&self, log: &Arc<LiveLog>) {
        self.inner
            .lock()
            .expect("log registry poisoned")
            .remove(&log.branch);
        log.close().await;
        debug!(branch = %log.branch, "closed live log");
    }

    /// Cancel the build attached to `branch`: succeeds, or reports the
    /// build as not cancellable, or as not running at all.
    pub fn cancel(&self, branch: &str) -> Result<()> {
        match self.lookup(branch) {
            Some(log) => log.request_cancel(),
            None => NoActiveBuildSnafu { branch }.fail(),
        }
    }
}
