//! # sage-db
//!
//! PostgreSQL layer for sage-supervisor.
//!
//! This crate provides:
//! - Connection pool management
//! - The transactional change queue (receiver and producer)
//! - The change-record repository used by the persistence policy
//! - An in-memory repository with the same semantics
//!
//! ## Example
//!
//! ```rust,ignore
//! use sage_db::{Database, PgQueueReceiver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/sage").await?;
//!     db.migrate().await?;
//!
//!     let receiver = PgQueueReceiver::new("postgres://localhost/sage");
//!     Ok(())
//! }
//! ```
pub mod changes;
pub mod memory;
pub mod pool;
pub mod queue;

// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use sage_core::*;

pub use changes::PgChangeRepository;
pub use memory::{MemoryChangeRepository, Stored};
pub use pool::{connect_pool, PoolConfig, PoolUsage};
pub use queue::{ConnectionState, PgChangeQueue, PgQueueReceiver};

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Persisted change records.
    pub changes: PgChangeRepository,
    /// Producer side of the change queue.
    pub queue: PgChangeQueue,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            changes: PgChangeRepository::new(pool.clone()),
            queue: PgChangeQueue::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the default pool configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Current connection occupancy of the pool.
    pub fn pool_usage(&self) -> PoolUsage {
        PoolUsage::of(&self.pool)
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
