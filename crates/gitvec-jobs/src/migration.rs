//! Resumable relational -> vector index migration.
//!
//! Walks the record store in keyset-paginated batches and upserts one point
//! per record into the vector index. A checkpoint row is persisted after
//! every completed batch, so an interrupted run resumes from the last batch
//! boundary instead of starting over. Because point ids are deterministic,
//! re-running any batch converges on the same index state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use gitvec_core::{
    defaults, Error, MigrationCheckpoint, MigrationOptions, MigrationProgress, RecordStore,
    Result, VectorIndex, VectorPoint,
};

/// Drives a full rebuild (or top-up) of the vector index from the record
/// store.
pub struct MigrationCoordinator {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn VectorIndex>,
    checkpoint_name: String,
}

impl MigrationCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            store,
            index,
            checkpoint_name: defaults::MIGRATION_CHECKPOINT_NAME.to_string(),
        }
    }

    /// Use a custom checkpoint name (for concurrent, separately-scoped runs).
    pub fn with_checkpoint_name(mut self, name: impl Into<String>) -> Self {
        self.checkpoint_name = name.into();
        self
    }

    /// Run the migration to completion (or to the first fatal error).
    ///
    /// Infrastructure errors (store or index unreachable) save a checkpoint
    /// and abort with `Err`. Per-record validation failures are recorded in
    /// the returned progress; with `continue_on_error` off the run stops at
    /// the first one but still returns `Ok` with the partial progress.
    pub async fn run(&self, options: MigrationOptions) -> Result<MigrationProgress> {
        if options.batch_size == 0 {
            return Err(Error::Migration("batch_size must be positive".to_string()));
        }

        let total = self.store.count().await?;
        let mut progress = MigrationProgress::new(total, options.batch_size);
        let mut after = None;

        // Resume from the persisted batch boundary, if any.
        if !options.dry_run {
            if let Some(cp) = self.store.load_checkpoint(&self.checkpoint_name).await? {
                info!(
                    subsystem = "migration",
                    checkpoint = %self.checkpoint_name,
                    batches_done = cp.batches_done,
                    migrated = cp.migrated,
                    "resuming migration from checkpoint"
                );
                after = Some(cp.last_record_id);
                progress.current_batch = cp.batches_done;
                progress.migrated_records = cp.migrated;
                progress.skipped_records = cp.skipped;
                progress.failed_records = cp.failed;
            }
        }

        info!(
            subsystem = "migration",
            total_records = total,
            total_batches = progress.total_batches,
            batch_size = options.batch_size,
            dry_run = options.dry_run,
            "starting vector index migration"
        );

        loop {
            let page = match self.store.page_after(after, options.batch_size as i64).await {
                Ok(page) => page,
                Err(e) => {
                    self.save_checkpoint(&options, after, &progress).await;
                    return Err(e);
                }
            };
            if page.is_empty() {
                break;
            }
            let last_id = page.last().map(|r| r.id);

            // Validate and build points for this batch.
            let mut points = Vec::with_capacity(page.len());
            let mut abort_first_error = false;
            for record in &page {
                if options.validate_data {
                    if let Err(reason) = validate_record(record, options.expected_dimension) {
                        progress.failed_records += 1;
                        progress
                            .errors
                            .push(format!("record {}: {reason}", record.id));
                        if !options.continue_on_error {
                            warn!(
                                subsystem = "migration",
                                record_id = %record.id,
                                reason,
                                "stopping at first invalid record"
                            );
                            abort_first_error = true;
                            break;
                        }
                        continue;
                    }
                }
                let key = record.key();
                points.push(VectorPoint {
                    id: key.point_id(),
                    key,
                    repository_url: record.repository_url.clone(),
                    vector: record.vector.clone(),
                });
            }

            // Nothing from the partial batch is applied and the checkpoint
            // stays at the previous batch boundary, so a rerun revisits
            // every record of this page.
            if abort_first_error {
                return Ok(progress);
            }

            // Drop points already present in the index, when asked to.
            if options.skip_existing && !points.is_empty() {
                let ids: Vec<_> = points.iter().map(|p| p.id).collect();
                match self.index.exists(&ids).await {
                    Ok(present) => {
                        let present: std::collections::HashSet<_> = present.into_iter().collect();
                        let before = points.len();
                        points.retain(|p| !present.contains(&p.id));
                        progress.skipped_records += (before - points.len()) as u64;
                    }
                    Err(e) => {
                        self.save_checkpoint(&options, after, &progress).await;
                        return Err(e);
                    }
                }
            }

            if options.dry_run {
                progress.migrated_records += points.len() as u64;
            } else if !points.is_empty() {
                if let Err(e) = self.index.upsert(&points).await {
                    // The batch boundary saved is the one BEFORE this batch;
                    // rerunning it is safe because upserts are idempotent.
                    self.save_checkpoint(&options, after, &progress).await;
                    return Err(e);
                }
                let keys: Vec<_> = points.iter().map(|p| p.key.clone()).collect();
                if let Err(e) = self.store.mark_synced(&keys).await {
                    self.save_checkpoint(&options, after, &progress).await;
                    return Err(e);
                }
                progress.migrated_records += points.len() as u64;
            }

            // Batch committed; only now does it count towards the
            // checkpoint.
            progress.current_batch += 1;
            after = last_id;
            if !options.dry_run {
                self.save_checkpoint(&options, after, &progress).await;
            }

            debug!(
                subsystem = "migration",
                batch = progress.current_batch,
                percent = format!("{:.1}", progress.percent_complete()),
                eta_secs = progress
                    .estimated_time_remaining(Utc::now())
                    .map(|d| d.as_secs()),
                "migration batch done"
            );
        }

        if !options.dry_run {
            self.store.clear_checkpoint(&self.checkpoint_name).await?;
        }

        info!(
            subsystem = "migration",
            migrated = progress.migrated_records,
            skipped = progress.skipped_records,
            failed = progress.failed_records,
            batches = progress.current_batch,
            dry_run = options.dry_run,
            "migration complete"
        );
        Ok(progress)
    }

    /// Best-effort checkpoint write; failing to save must not mask the
    /// original error.
    async fn save_checkpoint(
        &self,
        options: &MigrationOptions,
        after: Option<uuid::Uuid>,
        progress: &MigrationProgress,
    ) {
        if options.dry_run {
            return;
        }
        let Some(last_record_id) = after else {
            return;
        };
        let checkpoint = MigrationCheckpoint {
            name: self.checkpoint_name.clone(),
            last_record_id,
            batches_done: progress.current_batch,
            migrated: progress.migrated_records,
            skipped: progress.skipped_records,
            failed: progress.failed_records,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
            warn!(
                subsystem = "migration",
                checkpoint = %self.checkpoint_name,
                error = %e,
                "failed to persist migration checkpoint"
            );
        }
    }
}

fn validate_record(
    record: &gitvec_core::EmbeddingRecord,
    expected_dimension: usize,
) -> std::result::Result<(), String> {
    let dim = record.vector.as_slice().len();
    if dim != expected_dimension {
        return Err(format!(
            "vector dimension {dim} does not match expected {expected_dimension}"
        ));
    }
    if record.content.is_empty() {
        return Err("empty content".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRecordStore, MemoryVectorIndex};
    use gitvec_core::{NewEmbeddingRecord, RecordKey};
    use pgvector::Vector;

    const DIM: usize = 8;

    fn record(project_id: i64, file_path: &str, dim: usize) -> NewEmbeddingRecord {
        NewEmbeddingRecord {
            project_id,
            repository_url: "https://git.example.com/a/b.git".to_string(),
            file_path: file_path.to_string(),
            content: format!("// {file_path}"),
            language: Some("rust".to_string()),
            vector: Vector::from(vec![0.5; dim]),
            commit_id: "c1".to_string(),
            branch: "main".to_string(),
        }
    }

    fn options() -> MigrationOptions {
        MigrationOptions {
            batch_size: 2,
            expected_dimension: DIM,
            ..Default::default()
        }
    }

    async fn seed(store: &MemoryRecordStore, count: usize) {
        let records: Vec<_> = (0..count)
            .map(|i| record(1, &format!("src/f{i:02}.rs"), DIM))
            .collect();
        store.upsert(&records).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_run_migrates_everything() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        seed(&store, 5).await;

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        let progress = coordinator.run(options()).await.unwrap();

        assert_eq!(progress.migrated_records, 5);
        assert_eq!(progress.failed_records, 0);
        assert_eq!(progress.current_batch, 3);
        assert_eq!(index.point_count(), 5);
        assert!((progress.percent_complete() - 100.0).abs() < f64::EPSILON);
        // Checkpoint removed after a complete run
        assert!(store
            .load_checkpoint(defaults::MIGRATION_CHECKPOINT_NAME)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failure_on_first_batch_aborts_and_rerun_converges() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        seed(&store, 6).await;

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        index.fail_next_upserts(1);
        let err = coordinator.run(options()).await.unwrap_err();
        assert!(matches!(err, Error::Index(_)));
        assert_eq!(index.point_count(), 0);

        let progress = coordinator.run(options()).await.unwrap();
        assert_eq!(progress.migrated_records, 6);
        assert_eq!(index.point_count(), 6);
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_from_checkpoint() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        seed(&store, 6).await;

        // Batch 1 (2 records) succeeds, batch 2 fails.
        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        index.fail_after_successes(1);
        let err = coordinator.run(options()).await.unwrap_err();
        assert!(matches!(err, Error::Index(_)));

        let cp = store
            .load_checkpoint(defaults::MIGRATION_CHECKPOINT_NAME)
            .await
            .unwrap()
            .expect("checkpoint persisted before aborting");
        assert_eq!(cp.batches_done, 1);
        assert_eq!(cp.migrated, 2);

        // Resume completes the remaining batches without redoing batch 1,
        // and the final state matches an uninterrupted run.
        let progress = coordinator.run(options()).await.unwrap();
        assert_eq!(progress.migrated_records, 6, "checkpoint counts carry over");
        assert_eq!(index.point_count(), 6);
        assert!(store
            .load_checkpoint(defaults::MIGRATION_CHECKPOINT_NAME)
            .await
            .unwrap()
            .is_none());

        let writer = crate::writer::DualStoreWriter::new(store, index);
        assert!(writer.verify_consistency(1).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        seed(&store, 3).await;

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        let progress = coordinator
            .run(MigrationOptions {
                dry_run: true,
                ..options()
            })
            .await
            .unwrap();

        assert_eq!(progress.migrated_records, 3);
        assert_eq!(index.point_count(), 0);
        assert!(store
            .load_checkpoint(defaults::MIGRATION_CHECKPOINT_NAME)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_skip_existing_counts_present_points() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        seed(&store, 4).await;

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        coordinator.run(options()).await.unwrap();
        assert_eq!(index.point_count(), 4);

        let progress = coordinator
            .run(MigrationOptions {
                skip_existing: true,
                ..options()
            })
            .await
            .unwrap();
        assert_eq!(progress.skipped_records, 4);
        assert_eq!(progress.migrated_records, 0);
        assert_eq!(index.point_count(), 4);
    }

    #[tokio::test]
    async fn test_invalid_records_are_reported() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        store
            .upsert(&[
                record(1, "good.rs", DIM),
                record(1, "bad-dim.rs", DIM + 1),
            ])
            .await
            .unwrap();

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        let progress = coordinator.run(options()).await.unwrap();

        assert_eq!(progress.migrated_records, 1);
        assert_eq!(progress.failed_records, 1);
        assert_eq!(progress.errors.len(), 1);
        assert!(progress.errors[0].contains("dimension"));
        assert_eq!(index.point_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_at_first_error_returns_partial_progress() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        store
            .upsert(&[record(1, "bad.rs", DIM + 1), record(1, "good.rs", DIM)])
            .await
            .unwrap();

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        let progress = coordinator
            .run(MigrationOptions {
                continue_on_error: false,
                batch_size: 10,
                ..options()
            })
            .await
            .unwrap();

        assert_eq!(progress.failed_records, 1);
        assert_eq!(progress.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_at_first_error_leaves_later_records_for_rerun() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        store
            .upsert(&[
                record(1, "good-a.rs", DIM),
                record(1, "bad.rs", DIM + 1),
                record(1, "good-b.rs", DIM),
            ])
            .await
            .unwrap();

        let coordinator = MigrationCoordinator::new(store.clone(), index.clone());
        let progress = coordinator
            .run(MigrationOptions {
                continue_on_error: false,
                batch_size: 10,
                ..options()
            })
            .await
            .unwrap();

        // The aborted page is not applied and no checkpoint advances past it.
        assert_eq!(progress.failed_records, 1);
        assert_eq!(progress.migrated_records, 0);
        assert_eq!(index.point_count(), 0);
        assert!(store
            .load_checkpoint(defaults::MIGRATION_CHECKPOINT_NAME)
            .await
            .unwrap()
            .is_none());

        // A permissive rerun picks up every valid record of that page.
        let progress = coordinator.run(options()).await.unwrap();
        assert_eq!(progress.migrated_records, 2);
        assert_eq!(index.point_count(), 2);

        let writer = crate::writer::DualStoreWriter::new(store, index);
        let report = writer.verify_consistency(1).await.unwrap();
        assert!(report.missing_in_store.is_empty());
        assert_eq!(report.missing_in_index.len(), 1, "only the invalid record");
        assert_eq!(report.missing_in_index[0].file_path, "bad.rs");
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let coordinator = MigrationCoordinator::new(store, index);

        let err = coordinator
            .run(MigrationOptions {
                batch_size: 0,
                ..options()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
    }

    #[tokio::test]
    async fn test_migration_then_verify_reports_consistent() {
        let store = Arc::new(MemoryRecordStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        seed(&store, 5).await;

        MigrationCoordinator::new(store.clone(), index.clone())
            .run(options())
            .await
            .unwrap();

        let writer = crate::writer::DualStoreWriter::new(store, index);
        assert!(writer.verify_consistency(1).await.unwrap().is_consistent());
    }

    #[test]
    fn test_validate_record() {
        let store_record = gitvec_core::EmbeddingRecord {
            id: gitvec_core::new_v7(),
            project_id: 1,
            repository_url: "u".to_string(),
            file_path: "f.rs".to_string(),
            content: "x".to_string(),
            language: None,
            vector: Vector::from(vec![0.0; DIM]),
            commit_id: "c".to_string(),
            branch: "main".to_string(),
            in_vector_index: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(validate_record(&store_record, DIM).is_ok());
        assert!(validate_record(&store_record, DIM + 1).is_err());

        let mut empty = store_record;
        empty.content.clear();
        assert!(validate_record(&empty, DIM).is_err());
    }

    #[test]
    fn test_record_keys_are_deterministic() {
        let key = RecordKey {
            project_id: 1,
            file_path: "src/a.rs".to_string(),
            commit_id: "c1".to_string(),
            branch: "main".to_string(),
        };
        assert_eq!(key.point_id(), key.point_id());
    }
}
