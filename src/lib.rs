//! Alder: a continuous-integration evaluation engine.
//!
//! Alder watches pull requests and refs mirrored from a code forge onto
//! a transactional, git-backed metadata store, evaluates declarative
//! build pipelines ("terms") against each observed target, and reports
//! the results back as commit statuses.
//!
//! # Architecture
//!
//! ```text
//! forge bridge ──► store (github-metadata branch)
//!                     │ watch
//!                     ▼
//!                  mirror ──► engine ──► term evaluator
//!                     ▲          │          │        │
//!                     │      set_state   live logs  cache branches
//!                     └──────────┘
//! ```
//!
//! The [`engine::Engine`] drives everything: it diffs each mirror
//! snapshot into its in-memory target set, recalculates every job under
//! the global term lock, and publishes statuses whose
//! `(hash, status, description)` triple changed. The HTTP layer, forge
//! API client and 9P facade live outside this crate and consume the
//! public read API plus the [`store::TreeStore`] contract.

#![warn(missing_docs)]

/// Content-addressed build cache over store branches.
pub mod cache;
/// Process-wide engine configuration.
pub mod config;
/// Fixed names and resource bounds.
pub mod constants;
/// Engine loop, target lifecycle, rebuild and cancel routers.
pub mod engine;
/// Engine-level error types.
pub mod error;
/// Live logs of in-progress builds.
pub mod logs;
/// Metadata mirror of forge state.
pub mod mirror;
/// Structural paths and identifiers.
pub mod path;
/// Transactional tree store contract and in-memory backend.
pub mod store;
/// Pipeline terms and their evaluator.
pub mod term;

pub use cache::BuildCache;
pub use cache::BuildInput;
pub use cache::LogTree;
pub use cache::Recipe;
pub use config::EngineConfig;
pub use config::PipelineMap;
pub use engine::Engine;
pub use error::EngineError;
pub use mirror::Mirror;
pub use mirror::Snapshot;
pub use mirror::StatusState;
pub use path::CommitHash;
pub use path::ProjectId;
pub use path::TargetId;
pub use path::TargetKind;
pub use path::TreePath;
pub use store::MemoryStore;
pub use store::TreeStore;
pub use term::Evaluator;
pub use term::JobId;
pub use term::Term;
