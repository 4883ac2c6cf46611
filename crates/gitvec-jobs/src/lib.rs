//! # gitvec-jobs
//!
//! Webhook ingress, job processing, and dual-store writing for gitvec.
//!
//! This crate provides:
//! - Webhook dedup and job enqueue (`WebhookProcessor`)
//! - The job worker loop with concurrent execution and per-job timeouts
//! - The dual-store writer (relational store + derived vector index)
//! - Resumable vector index migration (`MigrationCoordinator`)
//! - A stall sweeper returning abandoned work to the queue
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gitvec_db::Database;
//! use gitvec_jobs::{
//!     DualStoreWriter, EmbeddingJobHandler, JobWorker, WorkerConfig,
//! };
//! use gitvec_producer::HttpEmbeddingProducer;
//!
//! let db = Database::connect("postgres://...").await?;
//! let writer = Arc::new(DualStoreWriter::new(
//!     Arc::new(db.records),
//!     Arc::new(db.index),
//! ));
//! let producer = Arc::new(HttpEmbeddingProducer::from_env()?);
//! let handler = Arc::new(EmbeddingJobHandler::new(producer, writer));
//!
//! let worker = JobWorker::new(
//!     Arc::new(db.jobs),
//!     Arc::new(db.claims),
//!     handler,
//!     WorkerConfig::from_env(),
//! );
//! let handle = worker.start();
//!
//! // ... on shutdown:
//! handle.shutdown().await?;
//! ```

pub mod embed;
pub mod handler;
pub mod ingress;
pub mod memory;
pub mod migration;
pub mod worker;
pub mod writer;

// Re-export core types
pub use gitvec_core::*;

pub use embed::EmbeddingJobHandler;
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use ingress::{IngressOutcome, WebhookEvent, WebhookProcessor};
pub use migration::MigrationCoordinator;
pub use worker::{
    JobWorker, StallSweeper, SweeperConfig, SweeperHandle, WorkerConfig, WorkerEvent, WorkerHandle,
};
pub use writer::{BatchOutcome, DualStoreWriter, StaleOutcome};
