//! Core data model: dedup claims, embedding jobs, dual-store records, and
//! migration progress.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// DEDUP LEDGER
// =============================================================================

/// Status of a webhook claim in the dedup ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Processing,
    Completed,
    Failed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Processing => "processing",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Failed => "failed",
        }
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// `Completed` is terminal. `Failed` claims may be re-claimed
    /// (`Processing`) so a redelivery can retry the event.
    pub fn can_transition_to(&self, next: ClaimStatus) -> bool {
        matches!(
            (self, next),
            (ClaimStatus::Processing, ClaimStatus::Completed)
                | (ClaimStatus::Processing, ClaimStatus::Failed)
                | (ClaimStatus::Failed, ClaimStatus::Processing)
        )
    }

    /// Validate a transition, rejecting illegal ones.
    pub fn validate_transition(&self, next: ClaimStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                entity: "claim",
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

/// One row of the dedup ledger: an exclusive, time-bounded right to process
/// one webhook key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookClaim {
    pub key: String,
    pub event_type: String,
    pub project_id: i64,
    pub status: ClaimStatus,
    /// Identifies the claiming process instance.
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Parameters for acquiring a claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub key: String,
    pub event_type: String,
    pub project_id: i64,
    pub owner_id: String,
}

impl ClaimRequest {
    pub fn new(
        key: impl Into<String>,
        event_type: impl Into<String>,
        project_id: i64,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            event_type: event_type.into(),
            project_id,
            owner_id: owner_id.into(),
        }
    }
}

/// Outcome of a claim attempt. A duplicate is a normal result, not an error.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller owns the key and may proceed with side effects.
    Acquired,
    /// A live claim already exists; the event must be skipped.
    Duplicate {
        /// The existing claim, when it could still be read back.
        existing: Option<WebhookClaim>,
    },
}

impl ClaimOutcome {
    pub fn acquired(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired)
    }
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Status of an embedding job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// ```text
    /// pending -> processing -> { completed | retrying | failed }
    /// retrying -> processing   (loop, bounded by max_attempts)
    /// ```
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Retrying, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Retrying)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Validate a transition, rejecting illegal ones.
    pub fn validate_transition(&self, next: JobStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                entity: "job",
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

/// Classification of a job failure, driving retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network/timeout/storage — retried with backoff.
    Transient,
    /// Input cannot be embedded — consumes an attempt, may fail fast.
    Permanent,
}

/// One embedding job: a repository snapshot to (re)embed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: Uuid,
    pub repository_url: String,
    pub project_id: i64,
    pub commit_id: String,
    pub branch: String,
    /// Correlates with the webhook claim key that spawned this job.
    pub processing_id: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Lower value = higher urgency.
    pub priority: i32,
    pub is_reembedding: bool,
    /// Worker that currently owns the job, while processing.
    pub worker_id: Option<String>,
    pub error: Option<String>,
    /// Set while retrying; the job is not eligible before this instant.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for enqueueing an embedding job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub repository_url: String,
    pub project_id: i64,
    pub commit_id: String,
    pub branch: String,
    pub processing_id: String,
    pub priority: i32,
    pub is_reembedding: bool,
    pub max_attempts: i32,
}

impl EnqueueRequest {
    pub fn new(
        repository_url: impl Into<String>,
        project_id: i64,
        commit_id: impl Into<String>,
        branch: impl Into<String>,
        processing_id: impl Into<String>,
    ) -> Self {
        Self {
            repository_url: repository_url.into(),
            project_id,
            commit_id: commit_id.into(),
            branch: branch.into(),
            processing_id: processing_id.into(),
            priority: crate::defaults::JOB_PRIORITY,
            is_reembedding: false,
            max_attempts: crate::defaults::JOB_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn reembedding(mut self, yes: bool) -> Self {
        self.is_reembedding = yes;
        self
    }
}

/// Queue statistics summary, counts by status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub retrying: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

// =============================================================================
// DUAL-STORE RECORDS
// =============================================================================

/// Unique identity of an embedding record in both stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub project_id: i64,
    pub file_path: String,
    pub commit_id: String,
    pub branch: String,
}

impl RecordKey {
    /// Deterministic vector-point id for this key.
    ///
    /// Upserts into the vector index must be idempotent, so the point id is a
    /// hash of the key fields rather than a random UUID.
    pub fn point_id(&self) -> Uuid {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.project_id.to_le_bytes().as_slice());
        hasher.update(&[0]);
        hasher.update(self.file_path.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.commit_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.branch.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Uuid::from_bytes(bytes)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}#{}",
            self.project_id, self.file_path, self.branch, self.commit_id
        )
    }
}

/// A new embedding record to be applied to both stores.
#[derive(Debug, Clone)]
pub struct NewEmbeddingRecord {
    pub project_id: i64,
    pub repository_url: String,
    pub file_path: String,
    pub content: String,
    pub language: Option<String>,
    pub vector: Vector,
    pub commit_id: String,
    pub branch: String,
}

impl NewEmbeddingRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            project_id: self.project_id,
            file_path: self.file_path.clone(),
            commit_id: self.commit_id.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// A stored embedding record (relational store is the source of truth for
/// content and metadata).
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub project_id: i64,
    pub repository_url: String,
    pub file_path: String,
    pub content: String,
    pub language: Option<String>,
    pub vector: Vector,
    pub commit_id: String,
    pub branch: String,
    /// False when the vector-index write is pending or failed (re-sync flag).
    pub in_vector_index: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            project_id: self.project_id,
            file_path: self.file_path.clone(),
            commit_id: self.commit_id.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// One (file, vector) pair produced by the embedding producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedFile {
    pub file_path: String,
    pub content: String,
    pub language: Option<String>,
    pub vector: Vec<f32>,
}

// =============================================================================
// VECTOR INDEX
// =============================================================================

/// A point to upsert into the vector index.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub key: RecordKey,
    pub repository_url: String,
    pub vector: Vector,
}

impl VectorPoint {
    pub fn from_record(record: &NewEmbeddingRecord) -> Self {
        let key = record.key();
        Self {
            id: key.point_id(),
            key,
            repository_url: record.repository_url.clone(),
            vector: record.vector.clone(),
        }
    }
}

/// Filter for vector-index delete and search operations.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    pub project_id: Option<i64>,
    pub branch: Option<String>,
    /// Matches points whose commit id is NOT this value (stale pruning).
    pub commit_not: Option<String>,
}

/// One similarity search hit from the vector index.
#[derive(Debug, Clone)]
pub struct PointHit {
    pub id: Uuid,
    pub key: RecordKey,
    pub score: f32,
}

/// Divergence between the relational store and the vector index for one
/// project. Advisory: reported, never auto-corrected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub project_id: i64,
    /// Keys present in the relational store but absent from the index.
    pub missing_in_index: Vec<RecordKey>,
    /// Keys present in the index but absent from the relational store.
    pub missing_in_store: Vec<RecordKey>,
}

impl DivergenceReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_in_index.is_empty() && self.missing_in_store.is_empty()
    }
}

// =============================================================================
// MIGRATION
// =============================================================================

/// Options for a relational -> vector index migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    /// Validate vector dimensionality and non-empty content before writing.
    pub validate_data: bool,
    /// Skip records whose point already exists in the index.
    pub skip_existing: bool,
    /// Compute counts without applying any write.
    pub dry_run: bool,
    /// Record per-record failures and advance instead of aborting.
    pub continue_on_error: bool,
    /// Expected vector dimension when `validate_data` is on.
    pub expected_dimension: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: crate::defaults::MIGRATION_BATCH_SIZE,
            validate_data: true,
            skip_existing: false,
            dry_run: false,
            continue_on_error: true,
            expected_dimension: crate::defaults::EMBED_DIMENSION,
        }
    }
}

/// State of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub total_records: u64,
    pub migrated_records: u64,
    pub skipped_records: u64,
    pub failed_records: u64,
    pub current_batch: u64,
    pub total_batches: u64,
    pub start_time: DateTime<Utc>,
    pub errors: Vec<String>,
}

impl MigrationProgress {
    pub fn new(total_records: u64, batch_size: usize) -> Self {
        Self {
            total_records,
            migrated_records: 0,
            skipped_records: 0,
            failed_records: 0,
            current_batch: 0,
            total_batches: total_records.div_ceil(batch_size.max(1) as u64),
            start_time: Utc::now(),
            errors: Vec::new(),
        }
    }

    /// Records accounted for so far (migrated, skipped, or failed).
    pub fn processed(&self) -> u64 {
        self.migrated_records + self.skipped_records + self.failed_records
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_records == 0 {
            100.0
        } else {
            self.processed() as f64 / self.total_records as f64 * 100.0
        }
    }

    /// Remaining time extrapolated from throughput so far.
    pub fn estimated_time_remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let processed = self.processed();
        if processed == 0 || processed >= self.total_records {
            return None;
        }
        let elapsed = (now - self.start_time).to_std().ok()?;
        let per_record = elapsed.as_secs_f64() / processed as f64;
        let remaining = (self.total_records - processed) as f64 * per_record;
        Some(std::time::Duration::from_secs_f64(remaining))
    }
}

/// Persisted batch boundary so an interrupted run resumes without gaps or
/// reprocessing.
#[derive(Debug, Clone)]
pub struct MigrationCheckpoint {
    pub name: String,
    /// Last record id of the last fully completed batch.
    pub last_record_id: Uuid,
    pub batches_done: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub updated_at: DateTime<Utc>,
}
