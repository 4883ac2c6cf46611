//! # gitvec-producer
//!
//! Embedding producer backends for gitvec.
//!
//! The producer is the opaque, slow, failure-prone step of the pipeline: it
//! turns `(repository_url, commit_id, branch)` into one vector per file. The
//! HTTP backend talks to an external embedding service; the mock backend is
//! a scriptable stand-in for tests.

pub mod http;
pub mod mock;

pub use http::{HttpEmbeddingProducer, DEFAULT_PRODUCER_URL};
pub use mock::MockProducer;
