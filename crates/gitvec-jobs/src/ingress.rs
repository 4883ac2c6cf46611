//! Webhook ingress: dedup claim plus job enqueue.
//!
//! Source-control platforms redeliver webhooks at-least-once. The processor
//! derives a deterministic key from the event, claims it in the dedup
//! ledger, and only then enqueues the embedding job. The claim is taken
//! BEFORE any side effect, so a redelivered event observes the live claim
//! and is skipped; a ledger failure aborts the event so the platform's
//! redelivery retries the whole sequence.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gitvec_core::{
    keying, ClaimOutcome, ClaimRepository, ClaimRequest, EmbeddingJob, EnqueueRequest,
    JobRepository, Result,
};

/// A normalized webhook event from a source-control platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Platform identifier ("gitlab", "github", ...).
    pub platform: String,
    /// Event type ("push", "tag_push", ...).
    pub event_type: String,
    pub project_id: i64,
    pub repository_url: String,
    /// Head commit of the event; empty for events with nothing to embed
    /// (branch deletions).
    pub commit_id: String,
    pub branch: String,
}

impl WebhookEvent {
    /// Deterministic dedup key for this event.
    ///
    /// Two deliveries of the same logical event, however spaced in time,
    /// hash to the same key; a new commit on the same branch hashes to a
    /// different one.
    pub fn dedup_key(&self) -> String {
        let discriminator = format!("{}:{}", self.branch, self.commit_id);
        keying::webhook_key(
            &self.platform,
            &self.event_type,
            self.project_id,
            &discriminator,
        )
    }

    /// Whether the event carries embeddable work.
    pub fn has_work(&self) -> bool {
        !self.commit_id.is_empty()
    }
}

/// Outcome of processing one webhook delivery.
#[derive(Debug)]
pub enum IngressOutcome {
    /// Claim acquired and a job enqueued.
    Enqueued(EmbeddingJob),
    /// A live claim for this event already exists; nothing was done.
    Duplicate,
    /// Claim acquired but the event had no embeddable work; the claim was
    /// completed immediately.
    Ignored,
}

/// Turns webhook deliveries into at-most-one embedding job each.
pub struct WebhookProcessor {
    claims: Arc<dyn ClaimRepository>,
    jobs: Arc<dyn JobRepository>,
    /// Identifies this ingress instance in the ledger.
    owner_id: String,
}

impl WebhookProcessor {
    pub fn new(
        claims: Arc<dyn ClaimRepository>,
        jobs: Arc<dyn JobRepository>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            claims,
            jobs,
            owner_id: owner_id.into(),
        }
    }

    /// Process one webhook delivery.
    pub async fn process(&self, event: WebhookEvent) -> Result<IngressOutcome> {
        let key = event.dedup_key();

        let outcome = self
            .claims
            .claim(ClaimRequest::new(
                &key,
                &event.event_type,
                event.project_id,
                &self.owner_id,
            ))
            .await?;

        if let ClaimOutcome::Duplicate { existing } = outcome {
            debug!(
                subsystem = "ingress",
                claim_key = %key,
                project_id = event.project_id,
                existing_status = existing.as_ref().map(|c| c.status.as_str()),
                "duplicate webhook delivery skipped"
            );
            return Ok(IngressOutcome::Duplicate);
        }

        if !event.has_work() {
            self.claims.complete(&key, None).await?;
            debug!(
                subsystem = "ingress",
                claim_key = %key,
                project_id = event.project_id,
                "event carries no embeddable work, claim closed"
            );
            return Ok(IngressOutcome::Ignored);
        }

        let request = EnqueueRequest::new(
            &event.repository_url,
            event.project_id,
            &event.commit_id,
            &event.branch,
            &key,
        );
        match self.jobs.enqueue(request).await {
            Ok(job) => {
                info!(
                    subsystem = "ingress",
                    claim_key = %key,
                    job_id = %job.id,
                    project_id = event.project_id,
                    repository_url = %event.repository_url,
                    "webhook accepted, embedding job enqueued"
                );
                Ok(IngressOutcome::Enqueued(job))
            }
            Err(e) => {
                // Close the claim as failed so the platform's redelivery can
                // claim the key again.
                let error = e.to_string();
                if let Err(complete_err) =
                    self.claims.complete(&key, Some(&error)).await
                {
                    warn!(
                        subsystem = "ingress",
                        claim_key = %key,
                        error = %complete_err,
                        "failed to mark claim failed after enqueue error"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryClaimRepository, MemoryJobRepository};
    use gitvec_core::{ClaimStatus, JobStatus};

    fn event(commit_id: &str) -> WebhookEvent {
        WebhookEvent {
            platform: "gitlab".to_string(),
            event_type: "push".to_string(),
            project_id: 42,
            repository_url: "https://git.example.com/group/repo.git".to_string(),
            commit_id: commit_id.to_string(),
            branch: "main".to_string(),
        }
    }

    fn processor() -> (
        Arc<MemoryClaimRepository>,
        Arc<MemoryJobRepository>,
        WebhookProcessor,
    ) {
        let claims = Arc::new(MemoryClaimRepository::new());
        let jobs = Arc::new(MemoryJobRepository::new());
        let processor = WebhookProcessor::new(claims.clone(), jobs.clone(), "ingress-1");
        (claims, jobs, processor)
    }

    #[tokio::test]
    async fn test_first_delivery_enqueues_job() {
        let (claims, jobs, processor) = processor();
        let ev = event("abc123");
        let key = ev.dedup_key();

        let outcome = processor.process(ev).await.unwrap();
        let IngressOutcome::Enqueued(job) = outcome else {
            panic!("expected a job");
        };
        assert_eq!(job.processing_id, key);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(jobs.queue_stats().await.unwrap().pending, 1);

        let claim = claims.get(&key).await.unwrap().unwrap();
        assert_eq!(claim.status, ClaimStatus::Processing);
    }

    #[tokio::test]
    async fn test_redelivery_is_skipped_without_side_effects() {
        let (_, jobs, processor) = processor();

        processor.process(event("abc123")).await.unwrap();
        let outcome = processor.process(event("abc123")).await.unwrap();

        assert!(matches!(outcome, IngressOutcome::Duplicate));
        assert_eq!(jobs.queue_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_distinct_commits_get_distinct_jobs() {
        let (_, jobs, processor) = processor();

        processor.process(event("abc123")).await.unwrap();
        processor.process(event("def456")).await.unwrap();

        assert_eq!(jobs.queue_stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_event_without_work_completes_claim_immediately() {
        let (claims, jobs, processor) = processor();
        let ev = event("");
        let key = ev.dedup_key();

        let outcome = processor.process(ev).await.unwrap();
        assert!(matches!(outcome, IngressOutcome::Ignored));
        assert_eq!(jobs.queue_stats().await.unwrap().total, 0);

        let claim = claims.get(&key).await.unwrap().unwrap();
        assert_eq!(claim.status, ClaimStatus::Completed);
        // Redelivery of the empty event is still a duplicate
        let outcome = processor.process(event("")).await.unwrap();
        assert!(matches!(outcome, IngressOutcome::Duplicate));
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_enqueue_one_job() {
        let (_, jobs, _) = processor();
        let claims = Arc::new(MemoryClaimRepository::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let processor =
                WebhookProcessor::new(claims.clone(), jobs.clone(), "ingress-1");
            tasks.spawn(async move { processor.process(event("abc123")).await });
        }

        let mut enqueued = 0;
        while let Some(res) = tasks.join_next().await {
            if matches!(res.unwrap().unwrap(), IngressOutcome::Enqueued(_)) {
                enqueued += 1;
            }
        }
        assert_eq!(enqueued, 1);
        assert_eq!(jobs.queue_stats().await.unwrap().total, 1);
    }
}
