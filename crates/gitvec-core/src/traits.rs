//! Repository and backend traits.
//!
//! All cross-process coordination goes through these seams: the dedup ledger
//! and job queue expose atomic claim-or-fail operations as their sole
//! concurrency primitive, so any store offering conditional writes can back
//! them (the shipped implementations are PostgreSQL).

use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ClaimOutcome, ClaimRequest, EmbeddedFile, EmbeddingJob, EmbeddingRecord, EnqueueRequest,
    FailureKind, JobStatus, MigrationCheckpoint, NewEmbeddingRecord, PointFilter, PointHit,
    QueueStats, RecordKey, VectorPoint, WebhookClaim,
};

/// Dedup ledger: one durable row per webhook key.
#[async_trait]
pub trait ClaimRepository: Send + Sync {
    /// Atomically claim exclusive processing rights to a key.
    ///
    /// Returns `Duplicate` when a non-stale claim already exists in
    /// `processing` or `completed`; a failed or stale-processing claim is
    /// taken over. A failed claim due to a storage error must abort the
    /// caller before any side effect.
    async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome>;

    /// Mark the claim completed (no error) or failed (with error).
    /// Idempotent: completing an already-terminal claim is a no-op.
    async fn complete(&self, key: &str, error: Option<&str>) -> Result<()>;

    /// Fetch a claim by key.
    async fn get(&self, key: &str) -> Result<Option<WebhookClaim>>;

    /// Remove claims stuck in `processing` past the duration, so the
    /// platform's redelivery can claim again. Returns the reclaimed keys.
    async fn reclaim_stale(&self, max_processing: Duration) -> Result<Vec<String>>;
}

/// Durable embedding job queue.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a job in status `pending`.
    async fn enqueue(&self, req: EnqueueRequest) -> Result<EmbeddingJob>;

    /// Atomically claim the next eligible job for this worker.
    ///
    /// Eligible: `pending`, or `retrying` with `next_eligible_at <= now`.
    /// Ordered by priority ascending, then created_at ascending. No two
    /// concurrent callers may receive the same job.
    async fn dequeue_next(&self, worker_id: &str) -> Result<Option<EmbeddingJob>>;

    /// Transition `processing -> completed`.
    async fn report_success(&self, job_id: Uuid) -> Result<()>;

    /// Record a failed attempt and schedule the retry or terminal failure.
    /// Returns the status the job ended up in.
    async fn report_failure(
        &self,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<JobStatus>;

    /// Return jobs stuck in `processing` past the duration to `retrying`
    /// (counted as a failed attempt), or `failed` at the attempt cap.
    async fn cancel_stalled(&self, max_processing: Duration) -> Result<Vec<Uuid>>;

    /// Fetch a job by id.
    async fn get(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>>;

    /// Counts by status.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Delete old terminal jobs, keeping the most recent `keep_count` of
    /// them. Live jobs are never deleted. Returns the number deleted.
    async fn cleanup(&self, keep_count: i64) -> Result<i64>;
}

/// Relational embedding record store — the durability anchor of the pair.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Idempotent upsert keyed by (project_id, file_path, commit_id, branch);
    /// upserted rows are flagged `in_vector_index = false` until the index
    /// write is confirmed.
    async fn upsert(&self, records: &[NewEmbeddingRecord]) -> Result<()>;

    /// Flag rows whose index write is confirmed. The upsert itself resets
    /// the flag, so the failure direction needs no explicit call.
    async fn mark_synced(&self, keys: &[RecordKey]) -> Result<()>;

    /// Rows flagged for re-sync, oldest first.
    async fn list_unsynced(&self, limit: i64) -> Result<Vec<EmbeddingRecord>>;

    /// Delete rows for a branch whose commit no longer matches the latest
    /// processed one. Returns the number of rows deleted.
    async fn delete_stale(&self, project_id: i64, branch: &str, keep_commit: &str) -> Result<u64>;

    /// All record keys for a project (consistency audits).
    async fn keys_for_project(&self, project_id: i64) -> Result<Vec<RecordKey>>;

    /// Keyset pagination over all records, primary key ascending. Passing the
    /// last id of the previous page yields full coverage without overlap even
    /// under concurrent writes.
    async fn page_after(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<EmbeddingRecord>>;

    /// Total record count.
    async fn count(&self) -> Result<u64>;

    /// Load a persisted migration checkpoint by name.
    async fn load_checkpoint(&self, name: &str) -> Result<Option<MigrationCheckpoint>>;

    /// Persist a migration checkpoint (upsert by name).
    async fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> Result<()>;

    /// Remove a checkpoint after a run completes.
    async fn clear_checkpoint(&self, name: &str) -> Result<()>;
}

/// Vector index — a derived, rebuildable view over the record store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert points by id (idempotent, never append).
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;

    /// Delete points matching the filter. Returns the number deleted.
    async fn delete(&self, filter: &PointFilter) -> Result<u64>;

    /// Similarity search, optionally filtered.
    async fn search(
        &self,
        vector: &Vector,
        limit: i64,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<PointHit>>;

    /// Targeted existence check: the subset of `ids` present in the index.
    async fn exists(&self, ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// All record keys for a project (consistency audits).
    async fn keys_for_project(&self, project_id: i64) -> Result<Vec<RecordKey>>;
}

/// Embedding producer: opaque, slow, failure-prone `repository -> vectors`.
///
/// Implementations fail with `Error::ProducerTransient` (network, timeout) or
/// `Error::ProducerPermanent` (malformed repository); the scheduler treats
/// the two differently.
#[async_trait]
pub trait EmbeddingProducer: Send + Sync {
    async fn embed_repository(
        &self,
        repository_url: &str,
        commit_id: &str,
        branch: &str,
    ) -> Result<Vec<EmbeddedFile>>;
}
