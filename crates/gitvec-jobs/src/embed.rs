//! The embedding pipeline handler: produce vectors, apply them to both
//! stores, prune stale records.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use pgvector::Vector;
use tracing::{info, warn};

use gitvec_core::{EmbeddingProducer, Error, NewEmbeddingRecord};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::writer::DualStoreWriter;

/// Handler that runs the full pipeline for one embedding job.
pub struct EmbeddingJobHandler {
    producer: Arc<dyn EmbeddingProducer>,
    writer: Arc<DualStoreWriter>,
}

impl EmbeddingJobHandler {
    pub fn new(producer: Arc<dyn EmbeddingProducer>, writer: Arc<DualStoreWriter>) -> Self {
        Self { producer, writer }
    }
}

#[async_trait]
impl JobHandler for EmbeddingJobHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let job = &ctx.job;
        let start = Instant::now();

        let files = match self
            .producer
            .embed_repository(&job.repository_url, &job.commit_id, &job.branch)
            .await
        {
            Ok(files) => files,
            Err(e) => {
                return match e {
                    Error::ProducerPermanent(_) => JobResult::permanent(e.to_string()),
                    _ => JobResult::transient(e.to_string()),
                };
            }
        };

        let records: Vec<NewEmbeddingRecord> = files
            .into_iter()
            .map(|f| NewEmbeddingRecord {
                project_id: job.project_id,
                repository_url: job.repository_url.clone(),
                file_path: f.file_path,
                content: f.content,
                language: f.language,
                vector: Vector::from(f.vector),
                commit_id: job.commit_id.clone(),
                branch: job.branch.clone(),
            })
            .collect();

        let outcome = match self.writer.apply_batch(&records).await {
            Ok(outcome) => outcome,
            // Relational store write failed: nothing durable happened, retry.
            Err(e) => return JobResult::transient(e.to_string()),
        };

        // Old commits on this branch are superseded now that the new batch
        // is durable.
        if let Err(e) = self
            .writer
            .delete_stale(job.project_id, &job.branch, &job.commit_id)
            .await
        {
            warn!(
                subsystem = "queue",
                job_id = %job.id,
                error = %e,
                "stale pruning failed, superseded records remain"
            );
        }

        info!(
            subsystem = "queue",
            job_id = %job.id,
            project_id = job.project_id,
            records_written = outcome.written,
            records_deferred = outcome.deferred,
            duration_ms = start.elapsed().as_millis() as u64,
            "embedding job pipeline finished"
        );
        JobResult::Success {
            records_written: outcome.written,
            records_deferred: outcome.deferred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryJobRepository, MemoryRecordStore, MemoryVectorIndex};
    use gitvec_core::{EnqueueRequest, FailureKind, JobRepository, RecordStore};
    use gitvec_producer::MockProducer;

    async fn job(jobs: &MemoryJobRepository, commit_id: &str) -> gitvec_core::EmbeddingJob {
        jobs.enqueue(EnqueueRequest::new(
            "https://git.example.com/a/b.git",
            7,
            commit_id,
            "main",
            format!("claim-{commit_id}"),
        ))
        .await
        .unwrap()
    }

    fn pipeline(
        producer: MockProducer,
    ) -> (
        Arc<MemoryRecordStore>,
        Arc<MemoryVectorIndex>,
        EmbeddingJobHandler,
    ) {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let writer = Arc::new(DualStoreWriter::new(store.clone(), index.clone()));
        let handler = EmbeddingJobHandler::new(Arc::new(producer), writer);
        (store, index, handler)
    }

    #[tokio::test]
    async fn test_successful_job_writes_and_prunes() {
        let jobs = MemoryJobRepository::new();
        let (store, index, handler) = pipeline(
            MockProducer::new().with_files(vec!["src/a.rs", "src/b.rs"]),
        );

        // First commit
        let first = job(&jobs, "c1").await;
        let result = handler.execute(JobContext::new(first)).await;
        assert!(matches!(result, JobResult::Success { records_written: 2, .. }));

        // Second commit supersedes the first on the same branch
        let second = job(&jobs, "c2").await;
        handler.execute(JobContext::new(second)).await;

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(index.point_count(), 2);
        let keys = store.keys_for_project(7).await.unwrap();
        assert!(keys.iter().all(|k| k.commit_id == "c2"));
    }

    #[tokio::test]
    async fn test_transient_producer_error_maps_to_transient_failure() {
        let jobs = MemoryJobRepository::new();
        let (store, _, handler) = pipeline(MockProducer::new().failing_times(1));

        let result = handler.execute(JobContext::new(job(&jobs, "c1").await)).await;
        let JobResult::Failed { kind, .. } = result else {
            panic!("expected a failure");
        };
        assert_eq!(kind, FailureKind::Transient);
        assert_eq!(store.count().await.unwrap(), 0, "no partial writes");
    }

    #[tokio::test]
    async fn test_permanent_producer_error_maps_to_permanent_failure() {
        let jobs = MemoryJobRepository::new();
        let (_, _, handler) = pipeline(MockProducer::new().failing_permanently());

        let result = handler.execute(JobContext::new(job(&jobs, "c1").await)).await;
        let JobResult::Failed { kind, .. } = result else {
            panic!("expected a failure");
        };
        assert_eq!(kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_index_outage_still_succeeds_with_deferred_records() {
        let jobs = MemoryJobRepository::new();
        let (store, index, handler) = pipeline(MockProducer::new().with_files(vec!["a.rs"]));
        index.fail_next_upserts(1);

        let result = handler.execute(JobContext::new(job(&jobs, "c1").await)).await;
        let JobResult::Success {
            records_written,
            records_deferred,
        } = result
        else {
            panic!("expected success");
        };
        assert_eq!(records_written, 0);
        assert_eq!(records_deferred, 1);
        assert_eq!(store.list_unsynced(10).await.unwrap().len(), 1);
    }
}
