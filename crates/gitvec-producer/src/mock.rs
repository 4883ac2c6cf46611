//! Mock embedding producer for deterministic testing.
//!
//! Generates deterministic vectors from file paths, can be scripted to fail
//! a fixed number of times, and records every call for assertions.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gitvec_producer::mock::MockProducer;
//!
//! let producer = MockProducer::new()
//!     .with_files(vec!["src/lib.rs", "src/main.rs"])
//!     .failing_times(2);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gitvec_core::{EmbeddedFile, EmbeddingProducer, Error, Result};

/// One recorded embed_repository call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub repository_url: String,
    pub commit_id: String,
    pub branch: String,
}

/// Scriptable mock producer.
#[derive(Clone)]
pub struct MockProducer {
    file_paths: Vec<String>,
    dimension: usize,
    failures_remaining: Arc<AtomicUsize>,
    fail_permanently: bool,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self {
            file_paths: vec!["src/lib.rs".to_string()],
            dimension: 8,
            failures_remaining: Arc::new(AtomicUsize::new(0)),
            fail_permanently: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the file paths returned by every successful call.
    pub fn with_files(mut self, paths: Vec<&str>) -> Self {
        self.file_paths = paths.into_iter().map(String::from).collect();
        self
    }

    /// Set the vector dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Fail the next `n` calls with a transient error, then succeed.
    pub fn failing_times(self, n: usize) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call with a permanent error.
    pub fn failing_permanently(mut self) -> Self {
        self.fail_permanently = true;
        self
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    /// Deterministic vector derived from the file path and commit.
    fn vector_for(&self, file_path: &str, commit_id: &str) -> Vec<f32> {
        let seed = file_path
            .bytes()
            .chain(commit_id.bytes())
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        (0..self.dimension)
            .map(|i| ((seed.wrapping_add(i as u32) % 1000) as f32) / 1000.0)
            .collect()
    }
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProducer for MockProducer {
    async fn embed_repository(
        &self,
        repository_url: &str,
        commit_id: &str,
        branch: &str,
    ) -> Result<Vec<EmbeddedFile>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                repository_url: repository_url.to_string(),
                commit_id: commit_id.to_string(),
                branch: branch.to_string(),
            });

        if self.fail_permanently {
            return Err(Error::ProducerPermanent(
                "repository unreadable (scripted)".to_string(),
            ));
        }
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::ProducerTransient(
                "connection reset (scripted)".to_string(),
            ));
        }

        Ok(self
            .file_paths
            .iter()
            .map(|path| EmbeddedFile {
                file_path: path.clone(),
                content: format!("// {path} at {commit_id}"),
                language: Some("rust".to_string()),
                vector: self.vector_for(path, commit_id),
            })
            .collect())
    }
}
