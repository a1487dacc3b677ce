//! Persistence of dispatched changes.

use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::Zero;
use tracing::debug;

use sage_core::{ChangeRepository, DomainEvent, Result};

use crate::dispatcher::ChangeSubscriber;

/// What the persistence policy did with one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored(i64),
    SkippedZeroTotal,
    SkippedPendingDocument,
    SkippedKnownParty,
}

/// Subscriber writing dispatched changes through a [`ChangeRepository`].
///
/// - documents with a zero total are never written
/// - a document is skipped while a pending record with the same piece
///   number and a different total exists
/// - a party is written only the first time its identity is seen
pub struct PersistenceSubscriber {
    repository: Arc<dyn ChangeRepository>,
}

impl PersistenceSubscriber {
    pub fn new(repository: Arc<dyn ChangeRepository>) -> Self {
        Self { repository }
    }

    /// Apply the persistence policy to one event.
    pub async fn persist(&self, event: &DomainEvent) -> Result<PersistOutcome> {
        match event {
            DomainEvent::DocumentChanged(change) => {
                if change.total_amount.is_zero() {
                    return Ok(PersistOutcome::SkippedZeroTotal);
                }
                if self
                    .repository
                    .has_pending_document(&change.entity_id, &change.total_amount)
                    .await?
                {
                    return Ok(PersistOutcome::SkippedPendingDocument);
                }
                let id = self.repository.append_document(change).await?;
                Ok(PersistOutcome::Stored(id))
            }
            DomainEvent::PartyChanged(change) => {
                if self.repository.party_exists(&change.entity_id).await? {
                    return Ok(PersistOutcome::SkippedKnownParty);
                }
                let id = self.repository.append_party(change).await?;
                Ok(PersistOutcome::Stored(id))
            }
            DomainEvent::TableChanged(change) => {
                let id = self.repository.append_table(change).await?;
                Ok(PersistOutcome::Stored(id))
            }
        }
    }
}

#[async_trait]
impl ChangeSubscriber for PersistenceSubscriber {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn on_change(&self, event: &DomainEvent) -> Result<()> {
        let outcome = self.persist(event).await?;
        let label = event.label();
        match outcome {
            PersistOutcome::Stored(id) => debug!(
                subsystem = "monitor",
                component = "persistence",
                entity_kind = %event.entity_kind(),
                entity_id = event.entity_id(),
                label = label.as_deref().unwrap_or("-"),
                id,
                "Change persisted"
            ),
            skipped => debug!(
                subsystem = "monitor",
                component = "persistence",
                entity_kind = %event.entity_kind(),
                entity_id = event.entity_id(),
                label = label.as_deref().unwrap_or("-"),
                reason = ?skipped,
                "Change not persisted"
            ),
        }
        Ok(())
    }
}
