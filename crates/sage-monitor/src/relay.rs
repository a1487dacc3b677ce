//! Periodic re-publication of dispatched changes to UI consumers.
//!
//! The relay is registered as a subscriber: the monitor's worker only pushes
//! onto an unbounded channel and never waits on UI consumers. A separate
//! task drains the channel on a fixed period and emits each change on the
//! [`EventBus`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use sage_core::{DomainEvent, Error, EventBus, Result};

use crate::dispatcher::ChangeSubscriber;

type RecentRing = Arc<Mutex<VecDeque<DomainEvent>>>;

/// Subscriber feeding the UI relay queue.
pub struct ChangeRelay {
    tx: mpsc::UnboundedSender<DomainEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DomainEvent>>>,
    recent: RecentRing,
    capacity: usize,
    relayed: Arc<AtomicU64>,
}

impl ChangeRelay {
    /// Relay keeping the `capacity` most recent changes.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let capacity = capacity.max(1);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            relayed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start draining the queue onto `bus` every `interval`.
    ///
    /// Fails if the relay task was already started or `interval` is zero.
    pub fn spawn(&self, bus: EventBus, interval: Duration) -> Result<RelayHandle> {
        if interval.is_zero() {
            return Err(Error::Config(
                "relay interval must be greater than zero".to_string(),
            ));
        }
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Internal("change relay already started".to_string()))?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let drain = Drain {
            rx,
            bus,
            recent: self.recent.clone(),
            capacity: self.capacity,
            relayed: self.relayed.clone(),
        };

        info!(
            subsystem = "monitor",
            component = "relay",
            interval_ms = interval.as_millis() as u64,
            "Change relay started"
        );
        let join = tokio::spawn(drain.run(interval, shutdown_rx));

        Ok(RelayHandle { shutdown_tx, join })
    }

    /// Most recently relayed changes, oldest first.
    pub fn recent_changes(&self) -> Vec<DomainEvent> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Total number of changes emitted on the bus.
    pub fn relayed_count(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}

impl Default for ChangeRelay {
    fn default() -> Self {
        Self::new(sage_core::defaults::RELAY_RECENT_CAPACITY)
    }
}

#[async_trait]
impl ChangeSubscriber for ChangeRelay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn on_change(&self, event: &DomainEvent) -> Result<()> {
        if self.tx.send(event.clone()).is_err() {
            // Relay task already shut down; UI delivery is best effort.
            trace!(
                subsystem = "monitor",
                component = "relay",
                entity_id = event.entity_id(),
                "Relay closed, change not queued"
            );
        }
        Ok(())
    }
}

struct Drain {
    rx: mpsc::UnboundedReceiver<DomainEvent>,
    bus: EventBus,
    recent: RecentRing,
    capacity: usize,
    relayed: Arc<AtomicU64>,
}

impl Drain {
    async fn run(mut self, interval: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.drain();
                    break;
                }
                _ = ticker.tick() => {
                    self.drain();
                }
            }
        }

        info!(
            subsystem = "monitor",
            component = "relay",
            relayed = self.relayed.load(Ordering::Relaxed),
            "Change relay stopped"
        );
    }

    fn drain(&mut self) {
        let mut drained = 0usize;
        while let Ok(event) = self.rx.try_recv() {
            {
                let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
                if recent.len() == self.capacity {
                    recent.pop_front();
                }
                recent.push_back(event.clone());
            }
            self.bus.emit(event);
            drained += 1;
        }
        if drained > 0 {
            self.relayed.fetch_add(drained as u64, Ordering::Relaxed);
            debug!(
                subsystem = "monitor",
                component = "relay",
                drained,
                "Relayed changes to UI"
            );
        }
    }
}

/// Handle for stopping a running relay task.
pub struct RelayHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Stop the relay after a final drain.
    pub async fn shutdown(self) -> Result<()> {
        // A send error means the task is already gone.
        let _ = self.shutdown_tx.send(()).await;
        self.join
            .await
            .map_err(|e| Error::Internal(format!("relay task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sage_core::{OperationKind, PartyChange};

    fn party(id: &str) -> DomainEvent {
        DomainEvent::PartyChanged(PartyChange {
            entity_id: id.to_string(),
            operation: OperationKind::Update,
            occurred_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            party_type: 0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_emits_on_next_tick() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let relay = ChangeRelay::new(10);
        let handle = relay.spawn(bus, Duration::from_millis(500)).unwrap();

        // Let the immediate first tick pass with an empty queue.
        tokio::time::sleep(Duration::from_millis(10)).await;
        relay.on_change(&party("C1")).await.unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.entity_id, "C1");
        assert_eq!(envelope.event_type, "party.changed");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_performs_final_drain() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let relay = ChangeRelay::new(10);
        let handle = relay
            .spawn(bus, Duration::from_secs(3600))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        relay.on_change(&party("C1")).await.unwrap();
        relay.on_change(&party("C2")).await.unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(rx.try_recv().unwrap().entity_id, "C1");
        assert_eq!(rx.try_recv().unwrap().entity_id, "C2");
        assert_eq!(relay.relayed_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_changes_ring_is_bounded() {
        let relay = ChangeRelay::new(2);
        let handle = relay
            .spawn(EventBus::new(16), Duration::from_millis(500))
            .unwrap();

        for id in ["A", "B", "C"] {
            relay.on_change(&party(id)).await.unwrap();
        }
        handle.shutdown().await.unwrap();

        let ids: Vec<_> = relay
            .recent_changes()
            .iter()
            .map(|e| e.entity_id().to_string())
            .collect();
        assert_eq!(ids, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_spawn_twice_fails() {
        let relay = ChangeRelay::default();
        let handle = relay
            .spawn(EventBus::default(), Duration::from_millis(500))
            .unwrap();
        assert!(relay
            .spawn(EventBus::default(), Duration::from_millis(500))
            .is_err());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_shutdown_is_not_an_error() {
        let relay = ChangeRelay::default();
        let handle = relay
            .spawn(EventBus::default(), Duration::from_millis(500))
            .unwrap();
        handle.shutdown().await.unwrap();
        assert!(relay.on_change(&party("late")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_rejected_and_relay_still_startable() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let relay = ChangeRelay::new(10);

        let err = relay.spawn(bus.clone(), Duration::ZERO).err();
        assert!(matches!(err, Some(Error::Config(_))));

        let handle = relay.spawn(bus, Duration::from_millis(500)).unwrap();
        relay.on_change(&party("C1")).await.unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(rx.try_recv().unwrap().entity_id, "C1");
    }
}
