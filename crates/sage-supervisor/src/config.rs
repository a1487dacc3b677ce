//! Service-level configuration.

use sage_core::defaults::{DATABASE_URL, DB_MAX_CONNECTIONS};
use sage_core::{Error, Result};

/// Where dispatched changes are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Keep changes in process memory (dry runs).
    Memory,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(Error::Config(format!("unknown store backend: {}", other))),
        }
    }
}

/// Connection settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Database holding the change queue.
    pub queue_database_url: String,
    /// Database receiving persisted changes.
    pub store_database_url: String,
    pub store_backend: StoreBackend,
    pub db_max_connections: u32,
}

impl ServiceConfig {
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_URL` | `postgres://localhost/sage` | Queue database |
    /// | `STORE_DATABASE_URL` | `DATABASE_URL` | Persistence database |
    /// | `STORE_BACKEND` | `postgres` | `postgres` or `memory` |
    /// | `DB_MAX_CONNECTIONS` | `10` | Store pool size |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let queue_database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DATABASE_URL.to_string());
        let store_database_url = lookup("STORE_DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| queue_database_url.clone());
        let store_backend = match lookup("STORE_BACKEND") {
            Some(v) if !v.trim().is_empty() => StoreBackend::parse(&v)?,
            _ => StoreBackend::Postgres,
        };
        let db_max_connections = lookup("DB_MAX_CONNECTIONS")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(DB_MAX_CONNECTIONS)
            .max(1);

        Ok(Self {
            queue_database_url,
            store_database_url,
            store_backend,
            db_max_connections,
        })
    }
}
