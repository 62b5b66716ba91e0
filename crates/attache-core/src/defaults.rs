//! Centralized default constants for attache.
//!
//! All crates reference these constants instead of defining their own magic
//! numbers. Organized by domain area.

// =============================================================================
// BLOBS
// =============================================================================

/// Length of generated storage keys (lowercase base36 characters).
pub const STORAGE_KEY_LENGTH: usize = 28;

/// Content type recorded when neither the caller nor magic-byte detection
/// can name one.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Default purpose embedded in blob signed IDs.
pub const SIGNED_ID_PURPOSE: &str = "blob_id";

/// Separator between the payload and digest halves of a signed ID.
pub const SIGNED_ID_SEPARATOR: &str = "--";

/// Minimum age in hours before an unattached blob is eligible for sweeping.
pub const SWEEP_MIN_AGE_HOURS: i64 = 48;

/// Default content store root for the filesystem backend.
pub const STORAGE_ROOT: &str = "./storage";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum attempts for a deferred purge task.
pub const JOB_MAX_ATTEMPTS: i32 = 5;

/// Default worker poll interval in milliseconds when the queue is empty.
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent tasks per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default task execution timeout in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 120;

/// Default worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Seconds a task may stay `running` before it is presumed abandoned by a
/// crashed worker and handed out again.
pub const JOB_STALE_AFTER_SECS: u64 = 600;

/// Failed tasks the in-memory queue retains for inspection.
pub const MEMORY_FAILED_TASK_HISTORY: usize = 256;

// =============================================================================
// DATABASE POOL
// =============================================================================

pub const POOL_MAX_CONNECTIONS: u32 = 10;

pub const POOL_MIN_CONNECTIONS: u32 = 1;

/// Seconds to wait for a pooled connection.
pub const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const POOL_IDLE_TIMEOUT_SECS: u64 = 600;

pub const POOL_MAX_LIFETIME_SECS: u64 = 1800;

/// How often a long-running worker logs pool usage.
pub const POOL_METRICS_INTERVAL_SECS: u64 = 60;
