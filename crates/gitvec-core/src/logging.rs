//! Structured logging schema and field name constants for gitvec.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation tools can query by standardized field names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "ingress", "queue", "writer", "migration", "db", "producer"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "worker", "pool", "stall_sweeper", "dual_store"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim", "dequeue_next", "apply_batch", "run_migration"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Webhook claim key being operated on.
pub const CLAIM_KEY: &str = "claim_key";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Source-control project id.
pub const PROJECT_ID: &str = "project_id";

/// Repository URL a job embeds.
pub const REPOSITORY_URL: &str = "repository_url";

/// Worker instance identifier.
pub const WORKER_ID: &str = "worker_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of embedding records in a batch.
pub const RECORD_COUNT: &str = "record_count";

/// Current migration batch number.
pub const BATCH: &str = "batch";

/// Attempt number of the current job execution.
pub const ATTEMPTS: &str = "attempts";

// ─── Consistency fields ────────────────────────────────────────────────────

/// Records present in the relational store but missing from the index.
pub const MISSING_IN_INDEX: &str = "missing_in_index";

/// Records present in the index but missing from the relational store.
pub const MISSING_IN_STORE: &str = "missing_in_store";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
