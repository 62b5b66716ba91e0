//! # attache-db
//!
//! Storage layer for attache.
//!
//! This crate provides:
//! - Content stores (filesystem and in-memory)
//! - PostgreSQL and in-memory repositories for blobs, slots, and deferred tasks
//! - The [`BlobRegistry`], which resolves attachables to durable blobs
//! - Connection pool management and schema migrations
//!
//! ## Example
//!
//! ```rust,ignore
//! use attache_db::{BlobRegistry, Database, FilesystemBackend};
//!
//! let db = Database::connect("postgres://localhost/attache").await?;
//! let registry = db.registry(FilesystemBackend::new("./storage"), config.signed_id_codec()?);
//! let blob = registry.find_or_create(&Attachable::upload("a.png", "image/png", bytes)).await?;
//! ```

pub mod blobs;
pub mod file_storage;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod slots;
pub mod tasks;

use std::sync::Arc;

// Re-export core types
pub use attache_core::*;

pub use blobs::PgBlobRepository;
pub use file_storage::FilesystemBackend;
pub use memory::{MemoryBlobRepository, MemoryContentStore, MemorySlotRepository, MemoryTaskQueue};
pub use pool::{
    create_pool, create_pool_with_config, log_pool_metrics, pool_metrics, PoolConfig, PoolMetrics,
};
pub use registry::{BlobRegistry, SWEEP_BATCH_SIZE};
pub use slots::PgSlotRepository;
pub use tasks::PgTaskQueue;

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub blobs: Arc<PgBlobRepository>,
    pub slots: Arc<PgSlotRepository>,
    pub tasks: Arc<PgTaskQueue>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            blobs: Arc::new(PgBlobRepository::new(pool.clone())),
            slots: Arc::new(PgSlotRepository::new(pool.clone())),
            tasks: Arc::new(PgTaskQueue::new(pool.clone())),
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
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Build a blob registry over this database's blob table and `store`.
    pub fn registry(
        &self,
        store: impl ContentStore + 'static,
        codec: SignedIdCodec,
    ) -> BlobRegistry {
        BlobRegistry::new(self.blobs.clone(), Arc::new(store), codec)
    }
}
