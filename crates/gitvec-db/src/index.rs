//! pgvector-backed vector index.
//!
//! A derived, rebuildable view over the record store. Point ids are
//! deterministic hashes of the record key, so upserts are idempotent and a
//! replayed write lands on the same row.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use gitvec_core::{Error, PointFilter, PointHit, RecordKey, Result, VectorIndex, VectorPoint};

/// PostgreSQL/pgvector implementation of VectorIndex.
pub struct PgVectorIndex {
    pool: Pool<Postgres>,
}

impl PgVectorIndex {
    /// Create a new PgVectorIndex with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn key_from_row(row: &sqlx::postgres::PgRow) -> RecordKey {
        RecordKey {
            project_id: row.get("project_id"),
            file_path: row.get("file_path"),
            commit_id: row.get("commit_id"),
            branch: row.get("branch"),
        }
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &PointFilter) {
        if let Some(project_id) = filter.project_id {
            builder.push(" AND project_id = ").push_bind(project_id);
        }
        if let Some(branch) = &filter.branch {
            builder.push(" AND branch = ").push_bind(branch.clone());
        }
        if let Some(commit) = &filter.commit_not {
            builder.push(" AND commit_id != ").push_bind(commit.clone());
        }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        for point in points {
            sqlx::query(
                "INSERT INTO vector_point
                     (id, project_id, file_path, commit_id, branch, repository_url, vector)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO UPDATE SET
                     repository_url = EXCLUDED.repository_url,
                     vector = EXCLUDED.vector",
            )
            .bind(point.id)
            .bind(point.key.project_id)
            .bind(&point.key.file_path)
            .bind(&point.key.commit_id)
            .bind(&point.key.branch)
            .bind(&point.repository_url)
            .bind(&point.vector)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn delete(&self, filter: &PointFilter) -> Result<u64> {
        let mut builder = QueryBuilder::new("DELETE FROM vector_point WHERE TRUE");
        Self::push_filter(&mut builder, filter);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn search(
        &self,
        vector: &Vector,
        limit: i64,
        filter: Option<&PointFilter>,
    ) -> Result<Vec<PointHit>> {
        // Cosine distance; score = 1 - distance so higher is better.
        let mut builder = QueryBuilder::new(
            "SELECT id, project_id, file_path, commit_id, branch, \
                 1 - (vector <=> ",
        );
        builder.push_bind(vector.clone());
        builder.push(") AS score FROM vector_point WHERE TRUE");
        if let Some(filter) = filter {
            Self::push_filter(&mut builder, filter);
        }
        builder.push(" ORDER BY vector <=> ");
        builder.push_bind(vector.clone());
        builder.push(" LIMIT ");
        builder.push_bind(limit);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| PointHit {
                id: row.get("id"),
                key: Self::key_from_row(&row),
                score: row.get::<f64, _>("score") as f32,
            })
            .collect())
    }

    async fn exists(&self, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let present: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM vector_point WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(present)
    }

    async fn keys_for_project(&self, project_id: i64) -> Result<Vec<RecordKey>> {
        let rows = sqlx::query(
            "SELECT project_id, file_path, commit_id, branch FROM vector_point
             WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::key_from_row).collect())
    }
}

#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::test_fixtures::test_pool;

    fn point(project_id: i64, file_path: &str, fill: f32) -> VectorPoint {
        let key = RecordKey {
            project_id,
            file_path: file_path.to_string(),
            commit_id: "c1".to_string(),
            branch: "main".to_string(),
        };
        VectorPoint {
            id: key.point_id(),
            key,
            repository_url: "https://git.example.com/group/repo.git".to_string(),
            vector: Vector::from(vec![fill; 768]),
        }
    }

    async fn cleanup(pool: &Pool<Postgres>, project_id: i64) {
        sqlx::query("DELETE FROM vector_point WHERE project_id = $1")
            .bind(project_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_upsert_same_key_lands_on_same_point() {
        let pool = test_pool().await;
        let index = PgVectorIndex::new(pool.clone());
        let project_id = 920_001;
        cleanup(&pool, project_id).await;

        let p = point(project_id, "src/lib.rs", 0.5);
        index.upsert(&[p.clone()]).await.unwrap();
        index.upsert(&[p.clone()]).await.unwrap();

        let present = index.exists(&[p.id]).await.unwrap();
        assert_eq!(present, vec![p.id]);
        assert_eq!(index.keys_for_project(project_id).await.unwrap().len(), 1);

        cleanup(&pool, project_id).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_delete_with_commit_not_filter() {
        let pool = test_pool().await;
        let index = PgVectorIndex::new(pool.clone());
        let project_id = 920_002;
        cleanup(&pool, project_id).await;

        let mut stale = point(project_id, "src/old.rs", 0.1);
        stale.key.commit_id = "c0".to_string();
        stale.id = stale.key.point_id();
        let fresh = point(project_id, "src/new.rs", 0.2);
        index.upsert(&[stale.clone(), fresh.clone()]).await.unwrap();

        let deleted = index
            .delete(&PointFilter {
                project_id: Some(project_id),
                branch: Some("main".to_string()),
                commit_not: Some("c1".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(index.exists(&[stale.id]).await.unwrap(), Vec::<Uuid>::new());
        assert_eq!(index.exists(&[fresh.id]).await.unwrap(), vec![fresh.id]);

        cleanup(&pool, project_id).await;
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database (set DATABASE_URL)"]
    async fn test_search_ranks_nearest_first() {
        let pool = test_pool().await;
        let index = PgVectorIndex::new(pool.clone());
        let project_id = 920_003;
        cleanup(&pool, project_id).await;

        let mut near = point(project_id, "src/near.rs", 0.0);
        let mut v = vec![0.0; 768];
        v[0] = 1.0;
        near.vector = Vector::from(v.clone());
        let mut far = point(project_id, "src/far.rs", 0.0);
        let mut w = vec![0.0; 768];
        w[1] = 1.0;
        far.vector = Vector::from(w);
        index.upsert(&[near.clone(), far]).await.unwrap();

        let hits = index
            .search(
                &Vector::from(v),
                2,
                Some(&PointFilter {
                    project_id: Some(project_id),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, near.id);
        assert!(hits[0].score > hits[1].score);

        cleanup(&pool, project_id).await;
    }
}
