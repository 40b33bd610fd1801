//! Engine-level error types.
//!
//! Structured errors with source chains preserved. Per-job evaluation
//! failures never surface here: the evaluator captures them and turns
//! them into a `failure` status. These errors are the ones that degrade
//! or stop the engine itself.

use snafu::Snafu;

use crate::logs::LogError;
use crate::mirror::MirrorError;
use crate::store::StoreError;

/// Result type for engine operations.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Engine failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    /// Store operation failed.
    #[snafu(display("store failure while {context}: {source}"))]
    Store {
        /// What the engine was doing.
        context: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// Mirror operation failed.
    #[snafu(display("mirror failure: {source}"))]
    Mirror {
        /// Underlying mirror error.
        source: MirrorError,
    },

    /// Live-log registry refused an operation.
    #[snafu(display("{source}"))]
    Log {
        /// Underlying log error.
        source: LogError,
    },

    /// `rebuild` was asked for a branch no saved log references.
    #[snafu(display("unknown build branch: {branch}"))]
    UnknownBuild {
        /// Requested branch name.
        branch: String,
    },

    /// The engine's cancellation token tripped.
    #[snafu(display("engine aborted"))]
    Aborted,
}

impl From<MirrorError> for EngineError {
    fn from(source: MirrorError) -> Self {
        EngineError::Mirror { source }
    }
}

impl From<LogError> for EngineError {
    fn from(source: LogError) -> Self {
        EngineError::Log { source }
    }
}
