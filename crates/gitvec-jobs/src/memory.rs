//! In-memory repository implementations for deterministic testing.
//!
//! Mirror the semantics of the PostgreSQL implementations closely enough to
//! exercise the ingress, writer, migration, and worker logic without a
//! database. The vector index supports scripted failure injection so
//! divergence handling can be tested.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use uuid::Uuid;

use gitvec_core::{
    new_v7, BackoffPolicy, ClaimOutcome, ClaimRepository, ClaimRequest, ClaimStatus,
    EmbeddingJob, EmbeddingRecord, EnqueueRequest, Error, FailureKind, JobRepository, JobStatus,
    MigrationCheckpoint, NewEmbeddingRecord, PointFilter, PointHit, QueueStats, RecordKey,
    RecordStore, Result, VectorIndex, VectorPoint, WebhookClaim,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Claims ────────────────────────────────────────────────────────────────

/// In-memory dedup ledger.
pub struct MemoryClaimRepository {
    claims: Mutex<HashMap<String, WebhookClaim>>,
    /// Claims in `processing` older than this are treated as stale.
    max_processing: Duration,
}

impl Default for MemoryClaimRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClaimRepository {
    pub fn new() -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            max_processing: Duration::from_secs(
                gitvec_core::defaults::CLAIM_MAX_PROCESSING_SECS,
            ),
        }
    }

    pub fn with_max_processing(mut self, max_processing: Duration) -> Self {
        self.max_processing = max_processing;
        self
    }
}

#[async_trait]
impl ClaimRepository for MemoryClaimRepository {
    async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome> {
        let now = Utc::now();
        let mut claims = lock(&self.claims);

        if let Some(existing) = claims.get(&req.key) {
            let stale = existing.status == ClaimStatus::Processing
                && (now - existing.started_at).to_std().unwrap_or_default()
                    >= self.max_processing;
            let takeover = existing.status == ClaimStatus::Failed || stale;
            if !takeover {
                return Ok(ClaimOutcome::Duplicate {
                    existing: Some(existing.clone()),
                });
            }
        }

        claims.insert(
            req.key.clone(),
            WebhookClaim {
                key: req.key,
                event_type: req.event_type,
                project_id: req.project_id,
                status: ClaimStatus::Processing,
                owner_id: req.owner_id,
                started_at: now,
                completed_at: None,
                error: None,
            },
        );
        Ok(ClaimOutcome::Acquired)
    }

    async fn complete(&self, key: &str, error: Option<&str>) -> Result<()> {
        let mut claims = lock(&self.claims);
        if let Some(existing) = claims.get_mut(key) {
            if existing.completed_at.is_some() {
                return Ok(());
            }
            existing.status = if error.is_some() {
                ClaimStatus::Failed
            } else {
                ClaimStatus::Completed
            };
            existing.completed_at = Some(Utc::now());
            existing.error = error.map(String::from);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<WebhookClaim>> {
        Ok(lock(&self.claims).get(key).cloned())
    }

    async fn reclaim_stale(&self, max_processing: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut claims = lock(&self.claims);
        let stale: Vec<String> = claims
            .values()
            .filter(|c| {
                c.status == ClaimStatus::Processing
                    && (now - c.started_at).to_std().unwrap_or_default() >= max_processing
            })
            .map(|c| c.key.clone())
            .collect();
        for key in &stale {
            claims.remove(key);
        }
        Ok(stale)
    }
}

// ─── Jobs ──────────────────────────────────────────────────────────────────

/// In-memory job queue with the same scheduling semantics as the PostgreSQL
/// queue.
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, EmbeddingJob>>,
    backoff: BackoffPolicy,
    fail_fast_on_permanent: bool,
}

impl Default for MemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            // Zero delay so retry sequences run instantly in tests.
            backoff: BackoffPolicy {
                base: Duration::ZERO,
                multiplier: 2.0,
                max: Duration::ZERO,
                jitter: 0.0,
            },
            fail_fast_on_permanent: true,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<EmbeddingJob> {
        let now = Utc::now();
        let job = EmbeddingJob {
            id: new_v7(),
            repository_url: req.repository_url,
            project_id: req.project_id,
            commit_id: req.commit_id,
            branch: req.branch,
            processing_id: req.processing_id,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: req.max_attempts,
            priority: req.priority,
            is_reembedding: req.is_reembedding,
            worker_id: None,
            error: None,
            next_eligible_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        lock(&self.jobs).insert(job.id, job.clone());
        Ok(job)
    }

    async fn dequeue_next(&self, worker_id: &str) -> Result<Option<EmbeddingJob>> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);

        let candidate = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    || (j.status == JobStatus::Retrying
                        && j.next_eligible_at.is_some_and(|t| t <= now))
            })
            .min_by_key(|j| (j.priority, j.created_at, j.id))
            .map(|j| j.id);

        Ok(candidate.map(|id| {
            let job = jobs.get_mut(&id).unwrap();
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            job.updated_at = now;
            job.worker_id = Some(worker_id.to_string());
            job.clone()
        }))
    }

    async fn report_success(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::Job(format!("job {job_id} not found")))?;
        job.status.validate_transition(JobStatus::Completed)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.worker_id = None;
        Ok(())
    }

    async fn report_failure(
        &self,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<JobStatus> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::Job(format!("job {job_id} not found")))?;
        job.status.validate_transition(JobStatus::Retrying)?;

        job.attempts += 1;
        job.error = Some(error.to_string());
        job.updated_at = now;
        job.worker_id = None;

        let terminal = job.attempts >= job.max_attempts
            || (kind == FailureKind::Permanent && self.fail_fast_on_permanent);
        if terminal {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.next_eligible_at = None;
        } else {
            job.status = JobStatus::Retrying;
            job.started_at = None;
            job.next_eligible_at = Some(self.backoff.next_eligible_at(now, job.attempts));
        }
        Ok(job.status)
    }

    async fn cancel_stalled(&self, max_processing: Duration) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        let mut stalled = Vec::new();

        for job in jobs.values_mut() {
            let expired = job.status == JobStatus::Processing
                && job
                    .started_at
                    .is_some_and(|t| (now - t).to_std().unwrap_or_default() >= max_processing);
            if !expired {
                continue;
            }
            job.attempts += 1;
            job.error = Some("worker exceeded max processing time".to_string());
            job.worker_id = None;
            job.started_at = None;
            job.updated_at = now;
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.next_eligible_at = None;
            } else {
                job.status = JobStatus::Retrying;
                job.next_eligible_at = Some(self.backoff.next_eligible_at(now, job.attempts));
            }
            stalled.push(job.id);
        }
        Ok(stalled)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>> {
        Ok(lock(&self.jobs).get(&job_id).cloned())
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs = lock(&self.jobs);
        let count = |s: JobStatus| jobs.values().filter(|j| j.status == s).count() as i64;
        Ok(QueueStats {
            pending: count(JobStatus::Pending),
            processing: count(JobStatus::Processing),
            retrying: count(JobStatus::Retrying),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            total: jobs.len() as i64,
        })
    }

    async fn cleanup(&self, keep_count: i64) -> Result<i64> {
        let mut jobs = lock(&self.jobs);
        let mut terminal: Vec<(Uuid, chrono::DateTime<Utc>)> = jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.id, j.completed_at.unwrap_or(j.updated_at)))
            .collect();
        terminal.sort_by(|a, b| b.1.cmp(&a.1));

        // Only terminal jobs count against the keep budget; live jobs are
        // never pruned.
        let mut deleted = 0;
        for (id, _) in terminal.into_iter().skip(keep_count.max(0) as usize) {
            jobs.remove(&id);
            deleted += 1;
        }
        Ok(deleted)
    }
}

// ─── Record store ──────────────────────────────────────────────────────────

struct StoredRecord {
    record: EmbeddingRecord,
}

/// In-memory relational record store, keyset-paginated over v7 ids.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<Uuid, StoredRecord>>,
    checkpoints: Mutex<HashMap<String, MigrationCheckpoint>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_id(records: &BTreeMap<Uuid, StoredRecord>, key: &RecordKey) -> Option<Uuid> {
        records
            .values()
            .find(|s| s.record.key() == *key)
            .map(|s| s.record.id)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, new_records: &[NewEmbeddingRecord]) -> Result<()> {
        let now = Utc::now();
        let mut records = lock(&self.records);
        for new in new_records {
            let key = new.key();
            if let Some(id) = Self::find_id(&records, &key) {
                let stored = records.get_mut(&id).unwrap();
                stored.record.content = new.content.clone();
                stored.record.language = new.language.clone();
                stored.record.vector = new.vector.clone();
                stored.record.in_vector_index = false;
                stored.record.updated_at = now;
            } else {
                let record = EmbeddingRecord {
                    id: new_v7(),
                    project_id: new.project_id,
                    repository_url: new.repository_url.clone(),
                    file_path: new.file_path.clone(),
                    content: new.content.clone(),
                    language: new.language.clone(),
                    vector: new.vector.clone(),
                    commit_id: new.commit_id.clone(),
                    branch: new.branch.clone(),
                    in_vector_index: false,
                    created_at: now,
                    updated_at: now,
                };
                records.insert(record.id, StoredRecord { record });
            }
        }
        Ok(())
    }

    async fn mark_synced(&self, keys: &[RecordKey]) -> Result<()> {
        let mut records = lock(&self.records);
        for key in keys {
            if let Some(id) = Self::find_id(&records, key) {
                records.get_mut(&id).unwrap().record.in_vector_index = true;
            }
        }
        Ok(())
    }

    async fn list_unsynced(&self, limit: i64) -> Result<Vec<EmbeddingRecord>> {
        let records = lock(&self.records);
        let mut unsynced: Vec<EmbeddingRecord> = records
            .values()
            .filter(|s| !s.record.in_vector_index)
            .map(|s| s.record.clone())
            .collect();
        unsynced.sort_by_key(|r| r.updated_at);
        unsynced.truncate(limit as usize);
        Ok(unsynced)
    }

    async fn delete_stale(&self, project_id: i64, branch: &str, keep_commit: &str) -> Result<u64> {
        let mut records = lock(&self.records);
        let stale: Vec<Uuid> = records
            .values()
            .filter(|s| {
                s.record.project_id == project_id
                    && s.record.branch == branch
                    && s.record.commit_id != keep_commit
            })
            .map(|s| s.record.id)
            .collect();
        for id in &stale {
            records.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn keys_for_project(&self, project_id: i64) -> Result<Vec<RecordKey>> {
        Ok(lock(&self.records)
            .values()
            .filter(|s| s.record.project_id == project_id)
            .map(|s| s.record.key())
            .collect())
    }

    async fn page_after(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<EmbeddingRecord>> {
        let records = lock(&self.records);
        let page: Vec<EmbeddingRecord> = records
            .iter()
            .filter(|(id, _)| after.is_none_or(|a| **id > a))
            .take(limit as usize)
            .map(|(_, s)| s.record.clone())
            .collect();
        Ok(page)
    }

    async fn count(&self) -> Result<u64> {
        Ok(lock(&self.records).len() as u64)
    }

    async fn load_checkpoint(&self, name: &str) -> Result<Option<MigrationCheckpoint>> {
        Ok(lock(&self.checkpoints).get(name).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> Result<()> {
        lock(&self.checkpoints).insert(checkpoint.name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, name: &str) -> Result<()> {
        lock(&self.checkpoints).remove(name);
        Ok(())
    }
}

// ─── Vector index ──────────────────────────────────────────────────────────

/// In-memory vector index with scripted failure injection.
#[derive(Default)]
pub struct MemoryVectorIndex {
    points: Mutex<HashMap<Uuid, VectorPoint>>,
    fail_next_upserts: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    upsert_calls: AtomicUsize,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upsert calls fail with an index error.
    pub fn fail_next_upserts(&self, n: usize) {
        self.fail_next_upserts.store(n, Ordering::SeqCst);
    }

    /// Let `n` upsert calls succeed, then fail the one after (once).
    pub fn fail_after_successes(&self, n: usize) {
        *lock(&self.fail_after) = Some(n);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn point_count(&self) -> usize {
        lock(&self.points).len()
    }

    fn matches(point: &VectorPoint, filter: &PointFilter) -> bool {
        filter.project_id.is_none_or(|p| point.key.project_id == p)
            && filter.branch.as_ref().is_none_or(|b| point.key.branch == *b)
            && filter
                .commit_not
                .as_ref()
                .is_none_or(|c| point.key.commit_id != *c)
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na * nb)
        }
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, new_points: &[VectorPoint]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next_upserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Index("index unavailable (scripted)".to_string()));
        }
        {
            let mut fail_after = lock(&self.fail_after);
            match *fail_after {
                Some(0) => {
                    *fail_after = None;
                    return Err(Error::Index("index unavailable (scripted)".to_string()));
                }
                Some(n) => *fail_after = Some(n - 1),
                None => {}
            }
        }
        let mut points = lock(&self.points);
        for point in new_points {
            points.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn delete(&self, filter: &PointFilter) -> Result<u64> {
        let mut points = lock(&self.points);
        let doomed: Vec<Uuid> = points
            .values()
            .filter(|p| Self::matches(p, filter))
            .map(|p| p.id)
            .collect();
        for id in &doomed {
            points.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn search(
        &self,
        vector: &Vector,
        limit: i64,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<PointHit>> {
        let points = lock(&self.points);
        let query = vector.as_slice();
        let mut hits: Vec<PointHit> = points
            .values()
            .filter(|p| filter.is_none_or(|f| Self::matches(p, f)))
            .map(|p| PointHit {
                id: p.id,
                key: p.key.clone(),
                score: Self::cosine(query, p.vector.as_slice()),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn exists(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let points = lock(&self.points);
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        Ok(points
            .keys()
            .filter(|id| wanted.contains(id))
            .copied()
            .collect())
    }

    async fn keys_for_project(&self, project_id: i64) -> Result<Vec<RecordKey>> {
        Ok(lock(&self.points)
            .values()
            .filter(|p| p.key.project_id == project_id)
            .map(|p| p.key.clone())
            .collect())
    }
}
