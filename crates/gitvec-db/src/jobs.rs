//! Embedding job queue repository implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use gitvec_core::{
    new_v7, BackoffPolicy, EmbeddingJob, EnqueueRequest, Error, FailureKind, JobRepository,
    JobStatus, QueueStats, Result,
};

/// Queue policy knobs shared by every worker instance.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry delay curve.
    pub backoff: BackoffPolicy,
    /// Fail a job terminally on the first permanent producer error instead of
    /// exhausting retries.
    pub fail_fast_on_permanent: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            fail_fast_on_permanent: true,
        }
    }
}

const JOB_COLUMNS: &str = "id, repository_url, project_id, commit_id, branch, processing_id, \
     status::text, attempts, max_attempts, priority, is_reembedding, worker_id, error, \
     next_eligible_at, created_at, updated_at, started_at, completed_at";

/// PostgreSQL implementation of JobRepository.
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    config: QueueConfig,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            config: QueueConfig::default(),
        }
    }

    /// Create with custom queue policy.
    pub fn with_config(pool: Pool<Postgres>, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Convert JobStatus to string for database.
    fn job_status_to_str(status: JobStatus) -> &'static str {
        status.as_str()
    }

    /// Convert string from database to JobStatus.
    fn str_to_job_status(s: &str) -> JobStatus {
        match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "retrying" => JobStatus::Retrying,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending, // fallback
        }
    }

    /// Parse a job row into an EmbeddingJob struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> EmbeddingJob {
        EmbeddingJob {
            id: row.get("id"),
            repository_url: row.get("repository_url"),
            project_id: row.get("project_id"),
            commit_id: row.get("commit_id"),
            branch: row.get("branch"),
            processing_id: row.get("processing_id"),
            status: Self::str_to_job_status(row.get("status")),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            priority: row.get("priority"),
            is_reembedding: row.get("is_reembedding"),
            worker_id: row.get("worker_id"),
            error: row.get("error"),
            next_eligible_at: row.get("next_eligible_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<EmbeddingJob> {
        let job_id = new_v7();
        let now = Utc::now();

        let row = sqlx::query(&format!(
            "INSERT INTO embedding_job
                 (id, repository_url, project_id, commit_id, branch, processing_id,
                  status, attempts, max_attempts, priority, is_reembedding, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, 'pending'::job_status, 0, $7, $8, $9, $10, $10)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(&req.repository_url)
        .bind(req.project_id)
        .bind(&req.commit_id)
        .bind(&req.branch)
        .bind(&req.processing_id)
        .bind(req.max_attempts)
        .bind(req.priority)
        .bind(req.is_reembedding)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_job_row(row))
    }

    async fn dequeue_next(&self, worker_id: &str) -> Result<Option<EmbeddingJob>> {
        let now = Utc::now();

        // FOR UPDATE SKIP LOCKED makes concurrent workers skip each other's
        // candidate row instead of blocking, so no job is handed out twice.
        let row = sqlx::query(&format!(
            "UPDATE embedding_job
             SET status = 'processing'::job_status, started_at = $1, updated_at = $1,
                 worker_id = $2
             WHERE id = (
                 SELECT id FROM embedding_job
                 WHERE status = 'pending'::job_status
                    OR (status = 'retrying'::job_status AND next_eligible_at <= $1)
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }

    async fn report_success(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE embedding_job
             SET status = 'completed'::job_status, completed_at = $1, updated_at = $1,
                 worker_id = NULL
             WHERE id = $2 AND status = 'processing'::job_status",
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::Job(format!(
                "job {job_id} is not processing, cannot complete"
            )));
        }
        Ok(())
    }

    async fn report_failure(
        &self,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<JobStatus> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "SELECT attempts, max_attempts, status::text FROM embedding_job
             WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::Job(format!("job {job_id} not found")))?;

        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let status = Self::str_to_job_status(row.get("status"));
        status.validate_transition(JobStatus::Retrying)?;

        let attempts = attempts + 1;
        let terminal = attempts >= max_attempts
            || (kind == FailureKind::Permanent && self.config.fail_fast_on_permanent);

        let next_status = if terminal {
            sqlx::query(
                "UPDATE embedding_job
                 SET status = 'failed'::job_status, attempts = $2, error = $3,
                     completed_at = $4, updated_at = $4, worker_id = NULL,
                     next_eligible_at = NULL
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            JobStatus::Failed
        } else {
            let eligible = self.config.backoff.next_eligible_at(now, attempts);
            sqlx::query(
                "UPDATE embedding_job
                 SET status = 'retrying'::job_status, attempts = $2, error = $3,
                     next_eligible_at = $4, updated_at = $5, started_at = NULL,
                     worker_id = NULL
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(attempts)
            .bind(error)
            .bind(eligible)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            JobStatus::Retrying
        };

        tx.commit().await.map_err(Error::Database)?;
        Ok(next_status)
    }

    async fn cancel_stalled(&self, max_processing: Duration) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(max_processing)
                .map_err(|e| Error::Job(e.to_string()))?;
        let backoff = &self.config.backoff;

        // The backoff curve is reproduced in SQL so each row gets a delay for
        // its own attempt count.
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE embedding_job
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= max_attempts
                               THEN 'failed'::job_status
                               ELSE 'retrying'::job_status END,
                 next_eligible_at = CASE WHEN attempts + 1 >= max_attempts
                               THEN NULL
                               ELSE $1 + LEAST($3 * power($4, attempts), $5) * interval '1 second' END,
                 completed_at = CASE WHEN attempts + 1 >= max_attempts THEN $1 ELSE NULL END,
                 error = 'worker exceeded max processing time',
                 started_at = NULL, worker_id = NULL, updated_at = $1
             WHERE status = 'processing'::job_status AND started_at < $2
             RETURNING id",
        )
        .bind(now)
        .bind(cutoff)
        .bind(backoff.base.as_secs_f64())
        .bind(backoff.multiplier)
        .bind(backoff.max.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(ids)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_job_row))
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'retrying') as retrying,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) as total
             FROM embedding_job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            processing: row.get::<i64, _>("processing"),
            retrying: row.get::<i64, _>("retrying"),
            completed: row.get::<i64, _>("completed"),
            failed: row.get::<i64, _>("failed"),
            total: row.get::<i64, _>("total"),
        })
    }

    async fn cleanup(&self, keep_count: i64) -> Result<i64> {
        // Live jobs are never pruned, whatever the keep budget.
        let result = sqlx::query(
            "DELETE FROM embedding_job
             WHERE status IN ('completed', 'failed')
               AND id NOT IN (
                 SELECT id FROM embedding_job
                 WHERE status IN ('completed', 'failed')
                 ORDER BY completed_at DESC NULLS LAST
                 LIMIT $1
             )",
        )
        .bind(keep_count)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() as i64)
    }
}
