//! # gitvec-db
//!
//! PostgreSQL database layer for gitvec.
//!
//! This crate provides:
//! - Connection pool management
//! - The webhook dedup ledger (`PgClaimRepository`)
//! - The durable embedding job queue (`PgJobRepository`)
//! - The relational embedding record store (`PgRecordStore`)
//! - A pgvector-backed vector index (`PgVectorIndex`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use gitvec_db::Database;
//! use gitvec_core::{ClaimRepository, ClaimRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/gitvec").await?;
//!
//!     let outcome = db
//!         .claims
//!         .claim(ClaimRequest::new("a1b2...", "push", 42, "worker-1"))
//!         .await?;
//!     println!("claimed: {}", outcome.acquired());
//!     Ok(())
//! }
//! ```

pub mod claims;
pub mod index;
pub mod jobs;
pub mod pool;
pub mod records;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use gitvec_core::*;

pub use claims::PgClaimRepository;
pub use index::PgVectorIndex;
pub use jobs::{PgJobRepository, QueueConfig};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use records::PgRecordStore;

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Webhook dedup ledger.
    pub claims: PgClaimRepository,
    /// Embedding job queue.
    pub jobs: PgJobRepository,
    /// Relational embedding record store.
    pub records: PgRecordStore,
    /// Derived vector index.
    pub index: PgVectorIndex,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            claims: PgClaimRepository::new(pool.clone()),
            jobs: PgJobRepository::new(pool.clone()),
            records: PgRecordStore::new(pool.clone()),
            index: PgVectorIndex::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
