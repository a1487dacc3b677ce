//! Ordered fan-out of dispatched changes to subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use sage_core::{DomainEvent, EntityKind, Error, RawChangeRecord, Result};

/// Consumer of dispatched change events.
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    /// Name used in logs and subscriber errors.
    fn name(&self) -> &str;

    /// Whether this subscriber wants events of the given kind.
    fn accepts(&self, _kind: EntityKind) -> bool {
        true
    }

    /// Handle one event. An error aborts delivery of this event to the
    /// remaining subscribers.
    async fn on_change(&self, event: &DomainEvent) -> Result<()>;
}

/// Delivers events to registered subscribers in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<Vec<Arc<dyn ChangeSubscriber>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber to the delivery list.
    pub async fn register(&self, subscriber: Arc<dyn ChangeSubscriber>) {
        let mut subscribers = self.subscribers.write().await;
        debug!(
            subsystem = "monitor",
            component = "dispatcher",
            subscriber = subscriber.name(),
            position = subscribers.len(),
            "Registered change subscriber"
        );
        subscribers.push(subscriber);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Convert `record` into its typed event and deliver it.
    ///
    /// Subscribers are awaited one after another; the first failure is
    /// returned as [`Error::Subscriber`] and later subscribers do not see
    /// the event.
    pub async fn publish(&self, record: RawChangeRecord) -> Result<DomainEvent> {
        let event = record.into_event();
        let kind = event.entity_kind();

        // Snapshot so registration never waits on a slow subscriber.
        let subscribers: Vec<Arc<dyn ChangeSubscriber>> =
            self.subscribers.read().await.iter().cloned().collect();

        for subscriber in subscribers.iter().filter(|s| s.accepts(kind)) {
            trace!(
                subsystem = "monitor",
                component = "dispatcher",
                subscriber = subscriber.name(),
                entity_kind = %kind,
                entity_id = event.entity_id(),
                "Delivering change"
            );
            subscriber
                .on_change(&event)
                .await
                .map_err(|e| match e {
                    e @ Error::Subscriber { .. } => e,
                    other => Error::subscriber(subscriber.name(), other),
                })?;
        }

        Ok(event)
    }
}
