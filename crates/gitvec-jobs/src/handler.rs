//! Job handler seam between the worker loop and the embedding pipeline.

use async_trait::async_trait;

use gitvec_core::{EmbeddingJob, FailureKind};

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: EmbeddingJob,
}

impl JobContext {
    pub fn new(job: EmbeddingJob) -> Self {
        Self { job }
    }
}

/// Result of job execution.
///
/// Handlers never talk to the queue directly; the worker loop translates
/// this into the queue transition (and the failure kind into retry-or-fail
/// scheduling).
#[derive(Debug)]
pub enum JobResult {
    /// Job completed; counts are for logging and events.
    Success {
        records_written: usize,
        /// Records whose index write is pending re-sync.
        records_deferred: usize,
    },
    /// Job failed with an error message and retry classification.
    Failed { error: String, kind: FailureKind },
}

impl JobResult {
    pub fn transient(error: impl Into<String>) -> Self {
        JobResult::Failed {
            error: error.into(),
            kind: FailureKind::Transient,
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        JobResult::Failed {
            error: error.into(),
            kind: FailureKind::Permanent,
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// No-op handler for testing.
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success {
            records_written: 0,
            records_deferred: 0,
        }
    }
}
