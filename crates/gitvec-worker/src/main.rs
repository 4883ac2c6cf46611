//! gitvec-worker - embedding pipeline worker daemon for gitvec.
//!
//! Connects to PostgreSQL, runs pending migrations, and drives the embedding
//! job queue plus the stall sweeper until terminated.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gitvec_db::{Database, PgClaimRepository, PgJobRepository, PgRecordStore, PgVectorIndex};
use gitvec_jobs::{
    DualStoreWriter, EmbeddingJobHandler, JobWorker, MigrationCoordinator, StallSweeper,
    SweeperConfig, WorkerConfig,
};
use gitvec_producer::HttpEmbeddingProducer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    //
    // Environment variables:
    //   LOG_FORMAT - "json" or "text" (default: "text")
    //   RUST_LOG   - standard env filter (default: "gitvec_worker=debug,gitvec_jobs=debug")
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gitvec_worker=debug,gitvec_jobs=debug,gitvec_db=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/gitvec".to_string());
    let db = Database::connect(&database_url).await?;
    db.migrate().await?;

    let pool = db.pool().clone();
    let claims: Arc<PgClaimRepository> = Arc::new(PgClaimRepository::new(pool.clone()));
    let jobs: Arc<PgJobRepository> = Arc::new(PgJobRepository::new(pool.clone()));
    let store: Arc<PgRecordStore> = Arc::new(PgRecordStore::new(pool.clone()));
    let index: Arc<PgVectorIndex> = Arc::new(PgVectorIndex::new(pool));

    let writer = Arc::new(DualStoreWriter::new(store.clone(), index.clone()));
    let producer = Arc::new(HttpEmbeddingProducer::from_env()?);
    let handler = Arc::new(EmbeddingJobHandler::new(producer, writer.clone()));

    // Optional one-shot index rebuild before serving the queue.
    if std::env::var("GITVEC_MIGRATE_INDEX").map(|v| v == "true" || v == "1") == Ok(true) {
        let progress = MigrationCoordinator::new(store.clone(), index.clone())
            .run(Default::default())
            .await?;
        info!(
            migrated = progress.migrated_records,
            skipped = progress.skipped_records,
            failed = progress.failed_records,
            "vector index migration finished"
        );
    }

    let worker = JobWorker::new(
        jobs.clone(),
        claims.clone(),
        handler,
        WorkerConfig::from_env(),
    );
    let worker_handle = worker.start();

    let sweeper = StallSweeper::new(jobs, claims, SweeperConfig::default());
    let sweeper_handle = sweeper.start();

    info!("gitvec-worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    worker_handle.shutdown().await?;
    sweeper_handle.shutdown().await?;
    Ok(())
}
