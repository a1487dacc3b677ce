//! Notification envelope and event bus for UI-facing change feeds.
//!
//! Dispatched [`DomainEvent`]s are re-published here by the relay task.
//! Downstream consumers (live change grids, SSE bridges, telemetry)
//! subscribe independently; delivery is best effort and a consumer that
//! falls behind loses the oldest notifications.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{DomainEvent, EntityKind};

/// Versioned envelope around a dispatched change.
///
/// ## Wire Format (JSON)
///
/// ```text
/// {"event_id":"...","event_type":"document.changed","relayed_at":"...",
///  "entity_kind":"document","entity_id":"FA00042","label":"Vente / Facture",
///  "payload":{"type":"DocumentChanged",...}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEnvelope {
    /// Unique notification identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type (e.g., `"party.changed"`).
    pub event_type: String,
    /// When the relay re-published the event (UTC wall clock).
    pub relayed_at: DateTime<Utc>,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Code-table label of the change (e.g., `"Achat / Facture"`, `"Client"`).
    pub label: Option<String>,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: DomainEvent,
}

impl ChangeEnvelope {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            relayed_at: Utc::now(),
            entity_kind: event.entity_kind(),
            entity_id: event.entity_id().to_string(),
            label: event.label(),
            payload_version: 1,
            payload: event,
        }
    }
}

/// Broadcast bus for change notifications.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangeEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit a change to all subscribers.
    ///
    /// If there are no active subscribers the notification is dropped.
    pub fn emit(&self, event: DomainEvent) {
        let envelope = ChangeEnvelope::new(event);
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            entity_id = %envelope.entity_id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped changes. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEnvelope> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationKind, PartyChange};
    use chrono::NaiveDate;

    fn party_event(id: &str) -> DomainEvent {
        DomainEvent::PartyChanged(PartyChange {
            entity_id: id.to_string(),
            operation: OperationKind::Insert,
            occurred_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(8, 30, 0)
                .unwrap(),
            party_type: 1,
        })
    }

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();

        bus.emit(party_event("FOURN01"));

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "party.changed");
        assert_eq!(envelope.entity_kind, EntityKind::Party);
        assert_eq!(envelope.entity_id, "FOURN01");
        assert_eq!(envelope.payload_version, 1);
    }

    #[tokio::test]
    async fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new(32);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(party_event("C1"));

        assert_eq!(rx1.recv().await.unwrap().entity_id, "C1");
        assert_eq!(rx2.recv().await.unwrap().entity_id, "C1");
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::new(4);
        bus.emit(party_event("C1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_envelope_serializes_payload() {
        let envelope = ChangeEnvelope::new(party_event("C9"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event_type"], "party.changed");
        assert_eq!(json["entity_kind"], "party");
        assert_eq!(json["payload"]["type"], "PartyChanged");
        assert_eq!(json["label"], "Fournisseur");
    }

    #[test]
    fn test_envelope_label_absent_for_unknown_code() {
        let mut event = party_event("C9");
        if let DomainEvent::PartyChanged(change) = &mut event {
            change.party_type = 42;
        }
        let envelope = ChangeEnvelope::new(event);
        assert_eq!(envelope.label, None);
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json["label"].is_null());
    }
}
