//! # gitvec-core
//!
//! Core types, traits, and abstractions for the gitvec pipeline.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other gitvec crates depend on: the webhook dedup ledger model, the
//! embedding job queue model, the dual-store record types, and the repository
//! traits their PostgreSQL implementations satisfy.

pub mod backoff;
pub mod defaults;
pub mod error;
pub mod keying;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use backoff::BackoffPolicy;
pub use error::{Error, Result};
pub use keying::webhook_key;
pub use models::*;
pub use traits::*;
pub use uuid_utils::{is_v7, new_v7};

/// Vector type shared with the pgvector storage layer.
pub use pgvector::Vector;
