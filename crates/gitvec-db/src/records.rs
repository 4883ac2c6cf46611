//! Relational embedding record store.
//!
//! This table is the durability anchor of the dual-store pair: the vector
//! index is derived from it and can always be rebuilt via the migration
//! coordinator. Each row carries an `in_vector_index` flag that tracks
//! whether its point has been confirmed in the index.

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use gitvec_core::{
    new_v7, EmbeddingRecord, Error, MigrationCheckpoint, NewEmbeddingRecord, RecordKey,
    RecordStore, Result,
};

const RECORD_COLUMNS: &str = "id, project_id, repository_url, file_path, content, language, \
     vector, commit_id, branch, in_vector_index, created_at, updated_at";

/// PostgreSQL implementation of RecordStore.
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    /// Create a new PgRecordStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: sqlx::postgres::PgRow) -> EmbeddingRecord {
        EmbeddingRecord {
            id: row.get("id"),
            project_id: row.get("project_id"),
            repository_url: row.get("repository_url"),
            file_path: row.get("file_path"),
            content: row.get("content"),
            language: row.get("language"),
            vector: row.get::<Vector, _>("vector"),
            commit_id: row.get("commit_id"),
            branch: row.get("branch"),
            in_vector_index: row.get("in_vector_index"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(&self, records: &[NewEmbeddingRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        for record in records {
            // Re-applying the same batch must converge on the same rows, so
            // conflicts on the record key overwrite content and reset the
            // index flag rather than erroring.
            sqlx::query(
                "INSERT INTO embedding_record
                     (id, project_id, repository_url, file_path, content, language,
                      vector, commit_id, branch, in_vector_index, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $10)
                 ON CONFLICT (project_id, file_path, commit_id, branch) DO UPDATE SET
                     repository_url = EXCLUDED.repository_url,
                     content = EXCLUDED.content,
                     language = EXCLUDED.language,
                     vector = EXCLUDED.vector,
                     in_vector_index = FALSE,
                     updated_at = EXCLUDED.updated_at",
            )
            .bind(new_v7())
            .bind(record.project_id)
            .bind(&record.repository_url)
            .bind(&record.file_path)
            .bind(&record.content)
            .bind(&record.language)
            .bind(&record.vector)
            .bind(&record.commit_id)
            .bind(&record.branch)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_synced(&self, keys: &[RecordKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        for key in keys {
            sqlx::query(
                "UPDATE embedding_record SET in_vector_index = TRUE, updated_at = $5
                 WHERE project_id = $1 AND file_path = $2 AND commit_id = $3 AND branch = $4",
            )
            .bind(key.project_id)
            .bind(&key.file_path)
            .bind(&key.commit_id)
            .bind(&key.branch)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn list_unsynced(&self, limit: i64) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM embedding_record
             WHERE in_vector_index = FALSE
             ORDER BY updated_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_record_row).collect())
    }

    async fn delete_stale(&self, project_id: i64, branch: &str, keep_commit: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM embedding_record
             WHERE project_id = $1 AND branch = $2 AND commit_id != $3",
        )
        .bind(project_id)
        .bind(branch)
        .bind(keep_commit)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn keys_for_project(&self, project_id: i64) -> Result<Vec<RecordKey>> {
        let rows = sqlx::query(
            "SELECT project_id, file_path, commit_id, branch FROM embedding_record
             WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| RecordKey {
                project_id: row.get("project_id"),
                file_path: row.get("file_path"),
                commit_id: row.get("commit_id"),
                branch: row.get("branch"),
            })
            .collect())
    }

    async fn page_after(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<EmbeddingRecord>> {
        // Keyset pagination over the primary key: stable under concurrent
        // inserts, unlike OFFSET.
        let rows = match after {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM embedding_record
                     WHERE id > $1 ORDER BY id ASC LIMIT $2"
                ))
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RECORD_COLUMNS} FROM embedding_record
                     ORDER BY id ASC LIMIT $1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_record_row).collect())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_record")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count as u64)
    }

    async fn load_checkpoint(&self, name: &str) -> Result<Option<MigrationCheckpoint>> {
        let row = sqlx::query(
            "SELECT name, last_record_id, batches_done, migrated, skipped, failed, updated_at
             FROM migration_checkpoint WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|row| MigrationCheckpoint {
            name: row.get("name"),
            last_record_id: row.get("last_record_id"),
            batches_done: row.get::<i64, _>("batches_done") as u64,
            migrated: row.get::<i64, _>("migrated") as u64,
            skipped: row.get::<i64, _>("skipped") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &MigrationCheckpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO migration_checkpoint
                 (name, last_record_id, batches_done, migrated, skipped, failed, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (name) DO UPDATE SET
                 last_record_id = EXCLUDED.last_record_id,
                 batches_done = EXCLUDED.batches_done,
                 migrated = EXCLUDED.migrated,
                 skipped = EXCLUDED.skipped,
                 failed = EXCLUDED.failed,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&checkpoint.name)
        .bind(checkpoint.last_record_id)
        .bind(checkpoint.batches_done as i64)
        .bind(checkpoint.migrated as i64)
        .bind(checkpoint.skipped as i64)
        .bind(checkpoint.failed as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn clear_checkpoint(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM migration_checkpoint WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::test_fixtures::test_pool;
    use gitvec_core::RecordStore;

    fn record(project_id: i64, file_path: &str, commit_id: &str) -> NewEmbeddingRecord {
        NewEmbeddingRecord {
            project_id,
            repository_url: "https://git.example.com/group/repo.git".to_string(),
            file_path: file_path.to_string(),
            content: format!("fn main() {{}} // {file_path}"),
            language: Some("rust".to_string()),
            vector: Vector::from(vec![0.1; 768]),
            commit_id: commit_id.to_string(),
            branch: "main".to_string(),
        }
    }

    async fn cleanup(pool: &Pool<Postgres>, project_id: i64) {
        sqlx::query("DELETE FROM embedding_record WHERE project_id = $1")
            .bind(project_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_upsert_is_idempotent_and_resets_sync_flag() {
        let pool = test_pool().await;
        let store = PgRecordStore::new(pool.clone());
        let project_id = 910_001;
        cleanup(&pool, project_id).await;

        let batch = vec![record(project_id, "src/lib.rs", "c1")];
        store.upsert(&batch).await.unwrap();
        store.mark_synced(&[batch[0].key()]).await.unwrap();

        // Second application of the same batch converges on one row,
        // flagged for re-sync again.
        store.upsert(&batch).await.unwrap();
        let keys = store.keys_for_project(project_id).await.unwrap();
        assert_eq!(keys.len(), 1);
        let unsynced = store.list_unsynced(10).await.unwrap();
        assert!(unsynced.iter().any(|r| r.key() == batch[0].key()));

        cleanup(&pool, project_id).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_delete_stale_keeps_latest_commit() {
        let pool = test_pool().await;
        let store = PgRecordStore::new(pool.clone());
        let project_id = 910_002;
        cleanup(&pool, project_id).await;

        store
            .upsert(&[
                record(project_id, "src/old.rs", "c1"),
                record(project_id, "src/kept.rs", "c2"),
            ])
            .await
            .unwrap();

        let deleted = store.delete_stale(project_id, "main", "c2").await.unwrap();
        assert_eq!(deleted, 1);
        let keys = store.keys_for_project(project_id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].commit_id, "c2");

        cleanup(&pool, project_id).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_page_after_covers_all_rows_without_overlap() {
        let pool = test_pool().await;
        let store = PgRecordStore::new(pool.clone());
        let project_id = 910_003;
        cleanup(&pool, project_id).await;

        let batch: Vec<_> = (0..5)
            .map(|i| record(project_id, &format!("src/f{i}.rs"), "c1"))
            .collect();
        store.upsert(&batch).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        let mut after = None;
        loop {
            let page = store.page_after(after, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            after = Some(page.last().unwrap().id);
            for rec in page {
                if rec.project_id == project_id {
                    assert!(seen.insert(rec.id), "row returned twice");
                }
            }
        }
        assert_eq!(seen.len(), 5);

        cleanup(&pool, project_id).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_checkpoint_round_trip() {
        let pool = test_pool().await;
        let store = PgRecordStore::new(pool.clone());
        let name = format!("test-migration-{}", Uuid::new_v4());

        assert!(store.load_checkpoint(&name).await.unwrap().is_none());

        let checkpoint = MigrationCheckpoint {
            name: name.clone(),
            last_record_id: new_v7(),
            batches_done: 3,
            migrated: 250,
            skipped: 40,
            failed: 10,
            updated_at: Utc::now(),
        };
        store.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = store.load_checkpoint(&name).await.unwrap().unwrap();
        assert_eq!(loaded.last_record_id, checkpoint.last_record_id);
        assert_eq!(loaded.batches_done, 3);
        assert_eq!(loaded.migrated, 250);

        store.clear_checkpoint(&name).await.unwrap();
        assert!(store.load_checkpoint(&name).await.unwrap().is_none());
    }
}
