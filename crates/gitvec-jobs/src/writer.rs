//! Dual-store writer: relational record store plus derived vector index.
//!
//! The relational store is the durability anchor. A batch is durable once
//! the relational write commits; the vector index write happens after and
//! its failure only defers the records for re-sync, never rolls anything
//! back. Divergence between the stores is therefore a normal, recoverable
//! state, surfaced by `verify_consistency` and repaired by `resync_pending`
//! or a full migration run.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use gitvec_core::{
    DivergenceReport, NewEmbeddingRecord, PointFilter, RecordStore, Result, VectorIndex,
    VectorPoint,
};

/// Outcome of applying one batch to both stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records durable in the relational store and confirmed in the index.
    pub written: usize,
    /// Records durable in the relational store but awaiting an index
    /// re-sync.
    pub deferred: usize,
}

/// Outcome of pruning stale records for a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleOutcome {
    pub records_deleted: u64,
    pub points_deleted: u64,
}

/// Coordinates writes across the record store and the vector index.
pub struct DualStoreWriter {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn VectorIndex>,
}

impl DualStoreWriter {
    pub fn new(store: Arc<dyn RecordStore>, index: Arc<dyn VectorIndex>) -> Self {
        Self { store, index }
    }

    /// Apply a batch of embedding records to both stores.
    ///
    /// The relational write must succeed or the whole call fails. The index
    /// write is best-effort: on failure the records stay flagged
    /// `in_vector_index = false` and the call still succeeds with the batch
    /// counted as deferred.
    pub async fn apply_batch(&self, records: &[NewEmbeddingRecord]) -> Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        self.store.upsert(records).await?;

        let points: Vec<VectorPoint> = records.iter().map(VectorPoint::from_record).collect();
        match self.index.upsert(&points).await {
            Ok(()) => {
                let keys: Vec<_> = records.iter().map(|r| r.key()).collect();
                self.store.mark_synced(&keys).await?;
                debug!(
                    subsystem = "writer",
                    record_count = records.len(),
                    "batch applied to both stores"
                );
                Ok(BatchOutcome {
                    written: records.len(),
                    deferred: 0,
                })
            }
            Err(e) => {
                // Records are already durable; they stay unsynced and will
                // be picked up by resync_pending.
                warn!(
                    subsystem = "writer",
                    record_count = records.len(),
                    error = %e,
                    "vector index write failed, batch deferred for re-sync"
                );
                Ok(BatchOutcome {
                    written: 0,
                    deferred: records.len(),
                })
            }
        }
    }

    /// Delete records for a branch whose commit is not the latest processed
    /// one, in both stores.
    pub async fn delete_stale(
        &self,
        project_id: i64,
        branch: &str,
        keep_commit: &str,
    ) -> Result<StaleOutcome> {
        let records_deleted = self.store.delete_stale(project_id, branch, keep_commit).await?;

        let filter = PointFilter {
            project_id: Some(project_id),
            branch: Some(branch.to_string()),
            commit_not: Some(keep_commit.to_string()),
        };
        let points_deleted = match self.index.delete(&filter).await {
            Ok(n) => n,
            Err(e) => {
                // Orphaned points are caught by verify_consistency and
                // removed by the next migration run.
                warn!(
                    subsystem = "writer",
                    project_id,
                    branch,
                    error = %e,
                    "vector index stale-delete failed, orphan points remain"
                );
                0
            }
        };

        if records_deleted > 0 || points_deleted > 0 {
            info!(
                subsystem = "writer",
                project_id,
                branch,
                records_deleted,
                points_deleted,
                "stale records pruned"
            );
        }
        Ok(StaleOutcome {
            records_deleted,
            points_deleted,
        })
    }

    /// Re-apply index writes for records flagged `in_vector_index = false`.
    /// Returns how many records were synced.
    pub async fn resync_pending(&self, limit: i64) -> Result<usize> {
        let pending = self.store.list_unsynced(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let points: Vec<VectorPoint> = pending
            .iter()
            .map(|r| {
                let key = r.key();
                VectorPoint {
                    id: key.point_id(),
                    key,
                    repository_url: r.repository_url.clone(),
                    vector: r.vector.clone(),
                }
            })
            .collect();
        self.index.upsert(&points).await?;

        let keys: Vec<_> = pending.iter().map(|r| r.key()).collect();
        self.store.mark_synced(&keys).await?;

        info!(
            subsystem = "writer",
            record_count = keys.len(),
            "pending records re-synced to the vector index"
        );
        Ok(keys.len())
    }

    /// Compare both stores for one project.
    ///
    /// Advisory only: the report is returned and logged, nothing is
    /// repaired here.
    pub async fn verify_consistency(&self, project_id: i64) -> Result<DivergenceReport> {
        let store_keys: HashSet<_> = self
            .store
            .keys_for_project(project_id)
            .await?
            .into_iter()
            .collect();
        let index_keys: HashSet<_> = self
            .index
            .keys_for_project(project_id)
            .await?
            .into_iter()
            .collect();

        let report = DivergenceReport {
            project_id,
            missing_in_index: store_keys.difference(&index_keys).cloned().collect(),
            missing_in_store: index_keys.difference(&store_keys).cloned().collect(),
        };

        if report.is_consistent() {
            debug!(subsystem = "writer", project_id, "stores are consistent");
        } else {
            warn!(
                subsystem = "writer",
                project_id,
                missing_in_index = report.missing_in_index.len(),
                missing_in_store = report.missing_in_store.len(),
                "store divergence detected"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRecordStore, MemoryVectorIndex};
    use pgvector::Vector;

    fn record(project_id: i64, file_path: &str, commit_id: &str) -> NewEmbeddingRecord {
        NewEmbeddingRecord {
            project_id,
            repository_url: "https://git.example.com/a/b.git".to_string(),
            file_path: file_path.to_string(),
            content: format!("// {file_path}"),
            language: Some("rust".to_string()),
            vector: Vector::from(vec![0.5; 8]),
            commit_id: commit_id.to_string(),
            branch: "main".to_string(),
        }
    }

    fn writer() -> (Arc<MemoryRecordStore>, Arc<MemoryVectorIndex>, DualStoreWriter) {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let writer = DualStoreWriter::new(store.clone(), index.clone());
        (store, index, writer)
    }

    #[tokio::test]
    async fn test_apply_batch_writes_both_stores() {
        let (store, index, writer) = writer();
        let batch = vec![record(1, "a.rs", "c1"), record(1, "b.rs", "c1")];

        let outcome = writer.apply_batch(&batch).await.unwrap();
        assert_eq!(outcome, BatchOutcome { written: 2, deferred: 0 });
        assert_eq!(index.point_count(), 2);
        assert!(store.list_unsynced(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_batch_is_idempotent() {
        let (store, index, writer) = writer();
        let batch = vec![record(1, "a.rs", "c1")];

        writer.apply_batch(&batch).await.unwrap();
        writer.apply_batch(&batch).await.unwrap();

        assert_eq!(index.point_count(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_failure_defers_instead_of_failing() {
        let (store, index, writer) = writer();
        index.fail_next_upserts(1);
        let batch = vec![record(1, "a.rs", "c1")];

        let outcome = writer.apply_batch(&batch).await.unwrap();
        assert_eq!(outcome, BatchOutcome { written: 0, deferred: 1 });
        // Durable in the store, absent from the index
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(index.point_count(), 0);

        let report = writer.verify_consistency(1).await.unwrap();
        assert_eq!(report.missing_in_index.len(), 1);
        assert!(report.missing_in_store.is_empty());
    }

    #[tokio::test]
    async fn test_resync_pending_repairs_divergence() {
        let (store, index, writer) = writer();
        index.fail_next_upserts(1);
        writer.apply_batch(&[record(1, "a.rs", "c1")]).await.unwrap();

        let synced = writer.resync_pending(10).await.unwrap();
        assert_eq!(synced, 1);
        assert_eq!(index.point_count(), 1);
        assert!(store.list_unsynced(10).await.unwrap().is_empty());
        assert!(writer.verify_consistency(1).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_delete_stale_prunes_both_stores() {
        let (store, index, writer) = writer();
        writer
            .apply_batch(&[record(1, "old.rs", "c1"), record(1, "new.rs", "c2")])
            .await
            .unwrap();

        let outcome = writer.delete_stale(1, "main", "c2").await.unwrap();
        assert_eq!(outcome.records_deleted, 1);
        assert_eq!(outcome.points_deleted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(index.point_count(), 1);
        assert!(writer.verify_consistency(1).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let (_, index, writer) = writer();
        let outcome = writer.apply_batch(&[]).await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(index.upsert_calls(), 0);
    }
}
