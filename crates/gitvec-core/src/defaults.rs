//! Centralized default constants for the gitvec system.
//!
//! **This module is the single source of truth** for all shared default
//! values. Crates and binaries reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// EMBEDDING
// =============================================================================

/// Default embedding vector dimension.
pub const EMBED_DIMENSION: usize = 768;

/// Timeout for a producer embed call (seconds). Repository embedding is slow.
pub const PRODUCER_TIMEOUT_SECS: u64 = 900;

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Default maximum attempts before a job fails terminally.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Default job priority. Lower value = higher urgency.
pub const JOB_PRIORITY: i32 = 5;

/// Polling interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Maximum concurrent jobs per worker process.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Per-job execution timeout (seconds).
pub const JOB_TIMEOUT_SECS: u64 = 1800;

/// Age past which a processing job is presumed abandoned (seconds).
pub const JOB_MAX_PROCESSING_SECS: u64 = 3600;

// =============================================================================
// BACKOFF
// =============================================================================

/// Base retry delay (seconds).
pub const BACKOFF_BASE_SECS: u64 = 30;

/// Multiplier applied per attempt.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Maximum retry delay (seconds).
pub const BACKOFF_MAX_SECS: u64 = 3600;

/// Jitter fraction applied symmetrically to the computed delay.
pub const BACKOFF_JITTER: f64 = 0.1;

// =============================================================================
// DEDUP LEDGER
// =============================================================================

/// Age past which a processing claim is reclaimable (seconds).
///
/// Must exceed the worst-case job retry horizon, since a claim stays
/// `processing` until its correlated job reaches a terminal state.
pub const CLAIM_MAX_PROCESSING_SECS: u64 = 7200;

// =============================================================================
// BACKGROUND SWEEPS
// =============================================================================

/// Interval between stalled-job / stale-claim sweeps (seconds).
pub const STALL_SWEEP_INTERVAL_SECS: u64 = 60;

// =============================================================================
// MIGRATION
// =============================================================================

/// Default migration batch size.
pub const MIGRATION_BATCH_SIZE: usize = 100;

/// Checkpoint name for the relational -> vector index migration.
pub const MIGRATION_CHECKPOINT_NAME: &str = "vector-migration";

// =============================================================================
// EVENTS
// =============================================================================

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;
