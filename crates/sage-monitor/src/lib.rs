//! # sage-monitor
//!
//! Change-notification ingestion pipeline for sage-supervisor.
//!
//! This crate provides:
//! - XML payload decoding into typed change records
//! - Near-duplicate suppression per entity kind
//! - Ordered, awaited fan-out to subscribers
//! - A supervised receive loop with restart-after-delay
//! - Persistence and UI-relay subscribers
//!
//! ## Log levels
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Loop failure, restart scheduled |
//! | WARN  | Malformed record dropped, payload not decodable |
//! | INFO  | Lifecycle events (start, stop, restart, connect) |
//! | DEBUG | Decision points (suppression, persistence skips) |
//! | TRACE | Per-receive iteration |
//!
//! Structured fields: `subsystem`, `component`, `op`, `entity_kind`,
//! `entity_id`, `attempt`, `error`.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sage_monitor::{ChangeMonitor, ChangeRelay, EventDispatcher, MonitorConfig, PersistenceSubscriber};
//!
//! let config = MonitorConfig::from_env()?;
//! let dispatcher = Arc::new(EventDispatcher::new());
//! dispatcher.register(Arc::new(PersistenceSubscriber::new(repository))).await;
//!
//! let relay = Arc::new(ChangeRelay::new(config.relay_recent_capacity));
//! dispatcher.register(relay.clone()).await;
//! let relay_handle = relay.spawn(bus.clone(), config.relay_interval)?;
//!
//! let monitor = ChangeMonitor::new(Box::new(receiver), dispatcher, config);
//! monitor.start();
//! // ...
//! monitor.stop().await;
//! relay_handle.shutdown().await?;
//! ```

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod monitor;
pub mod parser;
pub mod persistence;
pub mod relay;

// Note: Always compiled so integration tests (in tests/) can drive the monitor
pub mod testing;

// Re-export core types
pub use sage_core::*;

pub use config::{DedupStrategy, MonitorConfig};
pub use dedup::{DedupPolicy, Deduplicator};
pub use dispatcher::{ChangeSubscriber, EventDispatcher};
pub use monitor::{ChangeMonitor, MonitorState, MonitorStats, StatsSnapshot};
pub use parser::{MalformedRecord, ParsedPayload, PayloadParser, RecordError};
pub use persistence::{PersistOutcome, PersistenceSubscriber};
pub use relay::{ChangeRelay, RelayHandle};
