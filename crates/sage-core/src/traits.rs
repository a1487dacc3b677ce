//! Core traits for sage-supervisor collaborators.
//!
//! The ingestion pipeline only talks to the queue and to persistence through
//! these traits, so concrete backends are pluggable and testable.

use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

use crate::error::{Error, Result};
use crate::models::{DocumentChange, PartyChange, QueueMessage, TableChange};

// =============================================================================
// QUEUE
// =============================================================================

/// Outcome of a single blocking receive.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// Nothing arrived before the timeout; the normal idle case.
    Timeout,
    /// One message was taken off the queue.
    Message(QueueMessage),
    /// The connection was lost or could not be established.
    ConnectionError(Error),
}

impl ReceiveOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ReceiveOutcome::Timeout)
    }
}

/// Blocking receive against the transactional change queue.
///
/// Implementations hold at most one open connection, open it lazily on the
/// first receive, and never retry a failed connection themselves.
#[async_trait]
pub trait QueueReceiver: Send {
    /// Wait up to `timeout` for the next queue item.
    async fn receive_once(&mut self, timeout: Duration) -> ReceiveOutcome;

    /// Close the connection if one is open. Safe to call repeatedly.
    async fn close(&mut self);

    /// Whether a connection is currently open.
    fn is_open(&self) -> bool;
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Persistence of dispatched changes.
#[async_trait]
pub trait ChangeRepository: Send + Sync {
    /// Whether an unprocessed document record exists for `entity_id` with a
    /// total different from `total_amount`.
    async fn has_pending_document(&self, entity_id: &str, total_amount: &BigDecimal)
        -> Result<bool>;

    /// Whether any party record exists for `entity_id`.
    async fn party_exists(&self, entity_id: &str) -> Result<bool>;

    /// Append a document change; returns the stored row id.
    async fn append_document(&self, change: &DocumentChange) -> Result<i64>;

    /// Append a party change; returns the stored row id.
    async fn append_party(&self, change: &PartyChange) -> Result<i64>;

    /// Append a generic table change; returns the stored row id.
    async fn append_table(&self, change: &TableChange) -> Result<i64>;
}
