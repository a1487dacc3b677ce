//! Connection pool of the change store.
//!
//! The monitor writes changes synchronously, one at a time, so the pool is
//! sized by the operator and checked for saturation on every write.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use sage_core::defaults::{DB_CONNECT_TIMEOUT_SECS, DB_IDLE_TIMEOUT_SECS, DB_MAX_CONNECTIONS};
use sage_core::{Error, Result};

/// Store pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// How long a write may wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DB_MAX_CONNECTIONS)
    }
}

impl PoolConfig {
    /// Pool of at most `max_connections` (at least one).
    pub fn new(max_connections: u32) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout: Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Open the store pool.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(Duration::from_secs(DB_IDLE_TIMEOUT_SECS))
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Store pool established"
    );
    Ok(pool)
}

/// Connection occupancy of a pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub open: u32,
    pub idle: u32,
    pub max: u32,
}

impl PoolUsage {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            open: pool.size(),
            idle: pool.num_idle() as u32,
            max: pool.options().get_max_connections(),
        }
    }

    pub fn in_use(&self) -> u32 {
        self.open.saturating_sub(self.idle)
    }

    /// Every connection the pool may open is checked out; the next write
    /// waits up to the acquire timeout.
    pub fn is_saturated(&self) -> bool {
        self.max > 0 && self.in_use() >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_floor_is_one_connection() {
        assert_eq!(PoolConfig::new(0).max_connections, 1);
        assert_eq!(PoolConfig::default().max_connections, DB_MAX_CONNECTIONS);
    }

    #[test]
    fn test_acquire_timeout_override() {
        let config = PoolConfig::new(4).with_acquire_timeout(Duration::from_secs(2));
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn test_usage_saturation() {
        let usage = |open, idle, max| PoolUsage { open, idle, max };
        assert!(!usage(0, 0, 5).is_saturated());
        assert!(!usage(5, 1, 5).is_saturated());
        assert!(usage(5, 0, 5).is_saturated());
        assert_eq!(usage(3, 1, 5).in_use(), 2);
        // Idle count can briefly exceed open while connections close.
        assert_eq!(usage(1, 2, 5).in_use(), 0);
    }
}
