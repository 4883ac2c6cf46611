//! Dedup ledger repository implementation.
//!
//! One row per webhook key. Acquisition is a single conditional
//! `INSERT .. ON CONFLICT .. DO UPDATE .. WHERE` statement, so concurrent
//! callers race on the unique key and exactly one wins.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};

use gitvec_core::{
    ClaimOutcome, ClaimRepository, ClaimRequest, ClaimStatus, Error, Result, WebhookClaim,
};

/// PostgreSQL implementation of ClaimRepository.
pub struct PgClaimRepository {
    pool: Pool<Postgres>,
    /// Age past which a processing claim is considered abandoned.
    max_processing: Duration,
}

impl PgClaimRepository {
    /// Create a new PgClaimRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            max_processing: Duration::from_secs(gitvec_core::defaults::CLAIM_MAX_PROCESSING_SECS),
        }
    }

    /// Override the stale-claim window.
    pub fn with_max_processing(mut self, max_processing: Duration) -> Self {
        self.max_processing = max_processing;
        self
    }

    /// Convert ClaimStatus to string for database.
    fn claim_status_to_str(status: ClaimStatus) -> &'static str {
        status.as_str()
    }

    /// Convert string from database to ClaimStatus.
    fn str_to_claim_status(s: &str) -> ClaimStatus {
        match s {
            "processing" => ClaimStatus::Processing,
            "completed" => ClaimStatus::Completed,
            "failed" => ClaimStatus::Failed,
            _ => ClaimStatus::Failed, // fallback
        }
    }

    /// Parse a claim row into a WebhookClaim struct.
    fn parse_claim_row(row: sqlx::postgres::PgRow) -> WebhookClaim {
        WebhookClaim {
            key: row.get("key"),
            event_type: row.get("event_type"),
            project_id: row.get("project_id"),
            status: Self::str_to_claim_status(row.get("status")),
            owner_id: row.get("owner_id"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            error: row.get("error"),
        }
    }
}

#[async_trait]
impl ClaimRepository for PgClaimRepository {
    async fn claim(&self, req: ClaimRequest) -> Result<ClaimOutcome> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(self.max_processing)
                .map_err(|e| Error::Claim(e.to_string()))?;

        // The insert wins on a fresh key; the conditional update wins only
        // when the existing claim is failed (retryable) or stale-processing
        // (abandoned owner). A live processing or completed claim returns no
        // row, which is the duplicate signal.
        let claimed = sqlx::query_scalar::<_, String>(
            "INSERT INTO webhook_claim (key, event_type, project_id, status, owner_id, started_at)
             VALUES ($1, $2, $3, 'processing'::claim_status, $4, $5)
             ON CONFLICT (key) DO UPDATE
             SET status = 'processing'::claim_status,
                 owner_id = $4,
                 started_at = $5,
                 completed_at = NULL,
                 error = NULL
             WHERE webhook_claim.status = 'failed'::claim_status
                OR (webhook_claim.status = 'processing'::claim_status
                    AND webhook_claim.started_at < $6)
             RETURNING key",
        )
        .bind(&req.key)
        .bind(&req.event_type)
        .bind(req.project_id)
        .bind(&req.owner_id)
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if claimed.is_some() {
            debug!(
                subsystem = "ingress",
                op = "claim",
                claim_key = %req.key,
                project_id = req.project_id,
                "Acquired webhook claim"
            );
            return Ok(ClaimOutcome::Acquired);
        }

        // Lost the race or genuinely duplicate; read back the live claim.
        let existing = self.get(&req.key).await?;
        debug!(
            subsystem = "ingress",
            op = "claim",
            claim_key = %req.key,
            existing_status = existing.as_ref().map(|c| c.status.as_str()).unwrap_or("gone"),
            "Duplicate webhook delivery skipped"
        );
        Ok(ClaimOutcome::Duplicate { existing })
    }

    async fn complete(&self, key: &str, error: Option<&str>) -> Result<()> {
        let now = Utc::now();
        let status = if error.is_none() {
            ClaimStatus::Completed
        } else {
            ClaimStatus::Failed
        };

        // The completed_at guard makes a second call a no-op.
        let result = sqlx::query(
            "UPDATE webhook_claim
             SET status = $2::claim_status, error = $3, completed_at = $4
             WHERE key = $1 AND completed_at IS NULL",
        )
        .bind(key)
        .bind(Self::claim_status_to_str(status))
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            debug!(
                subsystem = "ingress",
                op = "complete",
                claim_key = %key,
                "Claim already terminal or missing, nothing to do"
            );
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<WebhookClaim>> {
        let row = sqlx::query(
            "SELECT key, event_type, project_id, status::text, owner_id,
                    started_at, completed_at, error
             FROM webhook_claim WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_claim_row))
    }

    async fn reclaim_stale(&self, max_processing: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_processing)
                .map_err(|e| Error::Claim(e.to_string()))?;

        let keys: Vec<String> = sqlx::query_scalar(
            "DELETE FROM webhook_claim
             WHERE status = 'processing'::claim_status AND started_at < $1
             RETURNING key",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        if !keys.is_empty() {
            warn!(
                subsystem = "ingress",
                op = "reclaim_stale",
                reclaimed = keys.len(),
                "Reclaimed stale webhook claims from crashed owners"
            );
        }
        Ok(keys)
    }
}


#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::test_fixtures::test_pool;

    fn request(key: &str) -> ClaimRequest {
        ClaimRequest {
            key: key.to_string(),
            event_type: "push".to_string(),
            project_id: 42,
            owner_id: "test-owner".to_string(),
        }
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_claim_then_duplicate() {
        let repo = PgClaimRepository::new(test_pool().await);
        let key = format!("test-{}", uuid::Uuid::new_v4());

        let first = repo.claim(request(&key)).await.unwrap();
        assert!(first.acquired());

        let second = repo.claim(request(&key)).await.unwrap();
        match second {
            ClaimOutcome::Duplicate { existing } => {
                assert_eq!(existing.unwrap().status, ClaimStatus::Processing);
            }
            ClaimOutcome::Acquired => panic!("second claim must not acquire"),
        }
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_concurrent_claims_exactly_one_winner() {
        let pool = test_pool().await;
        let key = format!("test-{}", uuid::Uuid::new_v4());

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let repo = PgClaimRepository::new(pool.clone());
            let mut req = request(&key);
            req.owner_id = format!("owner-{i}");
            tasks.spawn(async move { repo.claim(req).await.unwrap().acquired() });
        }

        let mut winners = 0;
        while let Some(res) = tasks.join_next().await {
            if res.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_completed_claim_stays_duplicate() {
        let repo = PgClaimRepository::new(test_pool().await);
        let key = format!("test-{}", uuid::Uuid::new_v4());

        assert!(repo.claim(request(&key)).await.unwrap().acquired());
        repo.complete(&key, None).await.unwrap();
        // Idempotent second completion
        repo.complete(&key, None).await.unwrap();

        match repo.claim(request(&key)).await.unwrap() {
            ClaimOutcome::Duplicate { existing } => {
                assert_eq!(existing.unwrap().status, ClaimStatus::Completed);
            }
            ClaimOutcome::Acquired => panic!("completed claim must reject"),
        }
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_failed_claim_is_reclaimable() {
        let repo = PgClaimRepository::new(test_pool().await);
        let key = format!("test-{}", uuid::Uuid::new_v4());

        assert!(repo.claim(request(&key)).await.unwrap().acquired());
        repo.complete(&key, Some("producer exploded")).await.unwrap();

        assert!(repo.claim(request(&key)).await.unwrap().acquired());
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_stale_claim_is_taken_over() {
        let repo =
            PgClaimRepository::new(test_pool().await).with_max_processing(Duration::from_secs(0));
        let key = format!("test-{}", uuid::Uuid::new_v4());

        assert!(repo.claim(request(&key)).await.unwrap().acquired());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Zero stale window: the first claim is immediately abandoned.
        assert!(repo.claim(request(&key)).await.unwrap().acquired());
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_reclaim_stale_only_touches_old_processing() {
        let repo = PgClaimRepository::new(test_pool().await);
        let fresh = format!("test-{}", uuid::Uuid::new_v4());
        assert!(repo.claim(request(&fresh)).await.unwrap().acquired());

        let reclaimed = repo.reclaim_stale(Duration::from_secs(3600)).await.unwrap();
        assert!(!reclaimed.contains(&fresh));
        assert!(repo.get(&fresh).await.unwrap().is_some());
    }
}
