//! Transactional tree store contract.
//!
//! The engine consumes a git-backed store through these traits: named
//! branches whose heads are immutable commits, commit trees readable by
//! path, and per-branch transactions that advance the head atomically.
//! The store distinguishes [`StoreError::NoEntry`] from every other
//! failure; the metadata mirror depends on that distinction to tell
//! "genuinely missing" apart from "broken".

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;

use crate::path::Step;
use crate::path::TreePath;

pub use memory::MemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The requested entry does not exist. Callers surface this as
    /// `None`; it never indicates a broken store.
    #[snafu(display("no entry at {path}"))]
    NoEntry {
        /// Path that was looked up.
        path: TreePath,
    },

    /// The path exists but is not a directory.
    #[snafu(display("not a directory: {path}"))]
    NotDirectory {
        /// Offending path.
        path: TreePath,
    },

    /// `create_file` on an existing entry.
    #[snafu(display("entry already exists at {path}"))]
    AlreadyExists {
        /// Offending path.
        path: TreePath,
    },

    /// Another transaction advanced the branch first.
    #[snafu(display("transaction conflict on branch {branch}"))]
    Conflict {
        /// Branch the transaction targeted.
        branch: String,
    },

    /// Any other backend failure (I/O, protocol, corruption).
    #[snafu(display("store backend failure: {message}"))]
    Backend {
        /// Backend-provided detail.
        message: String,
    },
}

impl StoreError {
    /// Whether this is the benign "entity missing" failure.
    pub fn is_no_entry(&self) -> bool {
        matches!(self, StoreError::NoEntry { .. })
    }
}

/// Identifier of a store commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of [`Branch::wait_for_head`].
pub enum HeadWait {
    /// The head changed; `None` means the branch currently has no head.
    NewHead(Option<Arc<dyn StoreCommit>>),
    /// The cancellation token was tripped.
    Aborted,
}

/// A tree store with named mutable branches.
pub trait TreeStore: Send + Sync {
    /// Obtain a handle to a named branch. The branch need not exist yet;
    /// an absent branch has no head.
    fn branch(&self, name: &str) -> Arc<dyn Branch>;
}

/// A named mutable branch.
#[async_trait]
pub trait Branch: Send + Sync {
    /// Branch name.
    fn name(&self) -> &str;

    /// Current head commit, or `None` for an absent/empty branch.
    async fn head(&self) -> StoreResult<Option<Arc<dyn StoreCommit>>>;

    /// Open a transaction rooted at the current head.
    ///
    /// Transactions are serializable with respect to other transactions
    /// on the same branch: commit performs a compare-and-swap against the
    /// head observed here and fails with [`StoreError::Conflict`] if the
    /// branch advanced in the meantime.
    async fn transaction(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Wait until the head differs from `last_seen`, or until `cancel`
    /// is tripped.
    ///
    /// Delivery is monotonic: each resolution observes a head at least as
    /// recent as the previous one, and intermediate commits may be
    /// skipped.
    async fn wait_for_head(
        &self,
        last_seen: Option<&CommitId>,
        cancel: &CancellationToken,
    ) -> StoreResult<HeadWait>;
}

/// An immutable commit on a branch.
pub trait StoreCommit: Send + Sync {
    /// Commit identifier.
    fn id(&self) -> &CommitId;

    /// Commit message.
    fn message(&self) -> &str;

    /// The tree recorded by this commit.
    fn tree(&self) -> Arc<dyn Tree>;
}

/// A read-only view of a commit's tree.
#[async_trait]
pub trait Tree: Send + Sync {
    /// Read a file's contents. [`StoreError::NoEntry`] if absent.
    async fn read_file(&self, path: &TreePath) -> StoreResult<Vec<u8>>;

    /// List a directory's immediate children, sorted.
    /// [`StoreError::NoEntry`] if the directory is absent.
    async fn read_dir(&self, path: &TreePath) -> StoreResult<Vec<Step>>;

    /// Whether a file exists at `path`.
    async fn exists_file(&self, path: &TreePath) -> StoreResult<bool>;
}

/// A mutable tree captured by [`Branch::transaction`].
#[async_trait]
pub trait Transaction: Send {
    /// Read a file from the transaction's view.
    async fn read_file(&self, path: &TreePath) -> StoreResult<Vec<u8>>;

    /// Whether a file exists in the transaction's view.
    async fn exists_file(&self, path: &TreePath) -> StoreResult<bool>;

    /// Create a directory and any missing ancestors.
    async fn make_dirs(&mut self, path: &TreePath) -> StoreResult<()>;

    /// Create a new file. [`StoreError::AlreadyExists`] if present.
    async fn create_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()>;

    /// Create or overwrite a file.
    async fn create_or_replace_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()>;

    /// Remove a file or directory subtree. [`StoreError::NoEntry`] if
    /// nothing exists at `path`.
    async fn remove(&mut self, path: &TreePath) -> StoreResult<()>;

    /// Atomically advance the branch to a commit of this tree.
    async fn commit(self: Box<Self>, message: &str) -> StoreResult<()>;

    /// Discard the transaction.
    async fn abort(self: Box<Self>);
}
