//! Process-wide constants for the evaluation engine.
//!
//! Constants are fixed and immutable, enforced at compile time. Each
//! constant has explicit bounds to prevent unbounded resource allocation.

use std::time::Duration;

/// Name of the store branch mirroring forge state.
pub const METADATA_BRANCH: &str = "github-metadata";

/// Branch probed by the supervisor to distinguish store failures from
/// task failures.
pub const PROBE_BRANCH: &str = "master";

/// Marker file enabling monitoring for a project.
pub const MONITOR_MARKER: &str = ".monitor";

/// Backoff between store reconnection attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Maximum attempts for a metadata-branch transaction before the
/// conflict is treated as fatal.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 10;

/// Initial backoff after a transaction conflict in milliseconds.
pub const TRANSACTION_RETRY_BACKOFF_MS: u64 = 10;

/// Per-subscriber live-log channel capacity. Producers block on a full
/// channel rather than dropping frames.
pub const LOG_CHANNEL_CAPACITY: usize = 128;

/// Maximum directory depth walked when discovering refs under a project.
pub const MAX_REF_DEPTH: usize = 16;

/// Maximum entries read from a single metadata directory.
pub const MAX_DIR_ENTRIES: usize = 10_000;
