//! Job worker and stall sweeper for the embedding queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use gitvec_core::{
    defaults, ClaimRepository, EmbeddingJob, Error, FailureKind, JobRepository, JobStatus, Result,
};

use crate::handler::{JobContext, JobHandler, JobResult};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this worker instance in job rows and logs.
    pub worker_id: String,
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Per-job execution timeout in seconds.
    pub job_timeout_secs: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GITVEC_WORKER_ID` | `worker-<uuid>` | Worker instance identifier |
    /// | `GITVEC_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `GITVEC_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `GITVEC_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `GITVEC_JOB_TIMEOUT_SECS` | `1800` | Per-job execution timeout |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_id = std::env::var("GITVEC_WORKER_ID").unwrap_or(defaults.worker_id);

        let enabled = std::env::var("GITVEC_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("GITVEC_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.max_concurrent_jobs)
            .max(1);

        let poll_interval_ms = std::env::var("GITVEC_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.poll_interval_ms);

        let job_timeout_secs = std::env::var("GITVEC_JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.job_timeout_secs);

        Self {
            worker_id,
            poll_interval_ms,
            max_concurrent_jobs,
            job_timeout_secs,
            enabled,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job was started.
    JobStarted { job_id: Uuid, attempts: i32 },
    /// A job completed successfully.
    JobCompleted {
        job_id: Uuid,
        records_written: usize,
        records_deferred: usize,
    },
    /// A job attempt failed and a retry was scheduled.
    JobRetried {
        job_id: Uuid,
        attempts: i32,
        error: String,
    },
    /// A job failed terminally.
    JobFailed { job_id: Uuid, error: String },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Job("failed to send shutdown signal".to_string()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    claims: Arc<dyn ClaimRepository>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        claims: Arc<dyn ClaimRepository>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            jobs,
            claims,
            handler,
            config,
            event_tx,
        }
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Run the worker loop with concurrent job processing.
    ///
    /// Claims up to `max_concurrent_jobs` at a time and processes them
    /// concurrently. Only sleeps when the queue is empty.
    #[instrument(skip_all, fields(worker_id = %self.config.worker_id))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(subsystem = "queue", "job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "queue",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!(subsystem = "queue", "job worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..self.config.max_concurrent_jobs {
                match self.claim_job().await {
                    Some(job) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_job(job).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(subsystem = "queue", "job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(subsystem = "queue", claimed, "processing concurrent job batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(subsystem = "queue", error = ?e, "job task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "queue", "job worker stopped");
    }

    async fn claim_job(&self) -> Option<EmbeddingJob> {
        match self.jobs.dequeue_next(&self.config.worker_id).await {
            Ok(job) => job,
            Err(e) => {
                error!(subsystem = "queue", error = ?e, "failed to claim job");
                None
            }
        }
    }

    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            jobs: self.jobs.clone(),
            claims: self.claims.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
            job_timeout: Duration::from_secs(self.config.job_timeout_secs),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    jobs: Arc<dyn JobRepository>,
    claims: Arc<dyn ClaimRepository>,
    handler: Arc<dyn JobHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout: Duration,
}

impl JobWorkerRef {
    async fn execute_job(self, job: EmbeddingJob) {
        let start = Instant::now();
        let job_id = job.id;
        let processing_id = job.processing_id.clone();

        info!(
            subsystem = "queue",
            job_id = %job_id,
            project_id = job.project_id,
            attempts = job.attempts,
            "processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            attempts: job.attempts,
        });

        let ctx = JobContext::new(job);
        let result = match tokio::time::timeout(self.job_timeout, self.handler.execute(ctx)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    subsystem = "queue",
                    job_id = %job_id,
                    timeout_secs = self.job_timeout.as_secs(),
                    "job exceeded execution timeout"
                );
                JobResult::Failed {
                    error: format!("job exceeded timeout of {}s", self.job_timeout.as_secs()),
                    kind: FailureKind::Transient,
                }
            }
        };

        match result {
            JobResult::Success {
                records_written,
                records_deferred,
            } => {
                if let Err(e) = self.jobs.report_success(job_id).await {
                    error!(subsystem = "queue", error = ?e, job_id = %job_id, "failed to mark job completed");
                    return;
                }
                self.close_claim(&processing_id, None).await;
                info!(
                    subsystem = "queue",
                    job_id = %job_id,
                    records_written,
                    records_deferred,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "job completed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                    job_id,
                    records_written,
                    records_deferred,
                });
            }
            JobResult::Failed { error, kind } => {
                let status = match self.jobs.report_failure(job_id, &error, kind).await {
                    Ok(status) => status,
                    Err(e) => {
                        error!(subsystem = "queue", error = ?e, job_id = %job_id, "failed to record job failure");
                        return;
                    }
                };
                match status {
                    JobStatus::Failed => {
                        self.close_claim(&processing_id, Some(&error)).await;
                        warn!(
                            subsystem = "queue",
                            job_id = %job_id,
                            error = %error,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "job failed terminally"
                        );
                        let _ = self
                            .event_tx
                            .send(WorkerEvent::JobFailed { job_id, error });
                    }
                    _ => {
                        let attempts = match self.jobs.get(job_id).await {
                            Ok(Some(job)) => job.attempts,
                            _ => 0,
                        };
                        warn!(
                            subsystem = "queue",
                            job_id = %job_id,
                            attempts,
                            error = %error,
                            "job attempt failed, retry scheduled"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobRetried {
                            job_id,
                            attempts,
                            error,
                        });
                    }
                }
            }
        }
    }

    /// Close the ledger entry that spawned this job once the job is
    /// terminal.
    async fn close_claim(&self, processing_id: &str, error: Option<&str>) {
        if let Err(e) = self.claims.complete(processing_id, error).await {
            error!(
                subsystem = "queue",
                claim_key = %processing_id,
                error = ?e,
                "failed to close webhook claim"
            );
        }
    }
}

/// Configuration for the stall sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Jobs in `processing` longer than this are returned to the queue.
    pub job_max_processing: Duration,
    /// Claims in `processing` longer than this are released.
    pub claim_max_processing: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::STALL_SWEEP_INTERVAL_SECS,
            job_max_processing: Duration::from_secs(defaults::JOB_MAX_PROCESSING_SECS),
            claim_max_processing: Duration::from_secs(defaults::CLAIM_MAX_PROCESSING_SECS),
        }
    }
}

/// Handle for stopping a running sweeper.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl SweeperHandle {
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Job("failed to send shutdown signal".to_string()))?;
        Ok(())
    }
}

/// Periodically returns stalled jobs to the queue and releases stale
/// claims left behind by crashed workers.
pub struct StallSweeper {
    jobs: Arc<dyn JobRepository>,
    claims: Arc<dyn ClaimRepository>,
    config: SweeperConfig,
}

impl StallSweeper {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        claims: Arc<dyn ClaimRepository>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            jobs,
            claims,
            config,
        }
    }

    /// Run one sweep. Public so operators can trigger it out of band.
    pub async fn sweep(&self) -> Result<()> {
        let stalled = self
            .jobs
            .cancel_stalled(self.config.job_max_processing)
            .await?;
        if !stalled.is_empty() {
            warn!(
                subsystem = "queue",
                component = "stall_sweeper",
                count = stalled.len(),
                "returned stalled jobs to the queue"
            );
        }

        let reclaimed = self
            .claims
            .reclaim_stale(self.config.claim_max_processing)
            .await?;
        if !reclaimed.is_empty() {
            warn!(
                subsystem = "ingress",
                component = "stall_sweeper",
                count = reclaimed.len(),
                "released stale webhook claims"
            );
        }
        Ok(())
    }

    /// Start the periodic sweep loop.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let interval = Duration::from_secs(self.config.interval_secs);

        tokio::spawn(async move {
            info!(
                subsystem = "queue",
                component = "stall_sweeper",
                interval_secs = self.config.interval_secs,
                "stall sweeper started"
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(interval) => {
                        if let Err(e) = self.sweep().await {
                            error!(
                                subsystem = "queue",
                                component = "stall_sweeper",
                                error = ?e,
                                "sweep failed"
                            );
                        }
                    }
                }
            }
            info!(
                subsystem = "queue",
                component = "stall_sweeper",
                "stall sweeper stopped"
            );
        });

        SweeperHandle { shutdown_tx }
    }
}
