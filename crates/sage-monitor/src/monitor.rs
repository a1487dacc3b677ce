//! Supervised change-monitoring loop.
//!
//! One worker task per monitoring session: receive, parse, suppress
//! near-duplicates and dispatch, strictly in sequence. Any failure closes
//! the queue connection and restarts the session after a fixed delay, for as
//! long as the monitor is not stopped.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use sage_core::{Error, QueueMessage, QueueReceiver, ReceiveOutcome, Result};

use crate::config::MonitorConfig;
use crate::dedup::Deduplicator;
use crate::dispatcher::EventDispatcher;
use crate::parser::PayloadParser;

/// Lifecycle of a [`ChangeMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    /// Waiting out the restart delay after a failure.
    Restarting,
    Stopping,
}

/// Running counters of a monitor.
#[derive(Debug, Default)]
pub struct MonitorStats {
    messages_received: AtomicU64,
    records_dispatched: AtomicU64,
    records_suppressed: AtomicU64,
    records_rejected: AtomicU64,
    restarts: AtomicU64,
}

/// Point-in-time copy of [`MonitorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub records_dispatched: u64,
    pub records_suppressed: u64,
    pub records_rejected: u64,
    pub restarts: u64,
}

impl MonitorStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            records_suppressed: self.records_suppressed.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

type SharedReceiver = Arc<Mutex<Box<dyn QueueReceiver>>>;

struct Session {
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Session),
    /// `stop()` is waiting for the session task to exit.
    Stopping,
}

/// Owner of the monitoring loop.
pub struct ChangeMonitor {
    config: MonitorConfig,
    parser: PayloadParser,
    dispatcher: Arc<EventDispatcher>,
    receiver: SharedReceiver,
    state_tx: Arc<watch::Sender<MonitorState>>,
    stats: Arc<MonitorStats>,
    lifecycle: StdMutex<Lifecycle>,
    /// Serializes concurrent `stop()` calls.
    stop_lock: Mutex<()>,
}

impl ChangeMonitor {
    pub fn new(
        receiver: Box<dyn QueueReceiver>,
        dispatcher: Arc<EventDispatcher>,
        config: MonitorConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(MonitorState::Stopped);
        Self {
            parser: PayloadParser::with_table_tags(config.table_tags.iter().cloned()),
            config,
            dispatcher,
            receiver: Arc::new(Mutex::new(receiver)),
            state_tx: Arc::new(state_tx),
            stats: Arc::new(MonitorStats::default()),
            lifecycle: StdMutex::new(Lifecycle::Idle),
            stop_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn state(&self) -> MonitorState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a session task is alive.
    pub fn is_running(&self) -> bool {
        match &*self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) {
            Lifecycle::Idle => false,
            Lifecycle::Running(session) => !session.join.is_finished(),
            Lifecycle::Stopping => true,
        }
    }

    /// Start a monitoring session. No-op while one is alive or stopping.
    pub fn start(&self) {
        if !self.config.enabled {
            info!(
                subsystem = "monitor",
                component = "loop",
                "Change monitor is disabled, not starting"
            );
            return;
        }
        if let Err(e) = self.config.validate() {
            error!(
                subsystem = "monitor",
                component = "loop",
                error = %e,
                "Invalid monitor configuration, not starting"
            );
            return;
        }

        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match &*lifecycle {
            Lifecycle::Running(session) if !session.join.is_finished() => {
                debug!(
                    subsystem = "monitor",
                    component = "loop",
                    "Change monitor already running"
                );
                return;
            }
            Lifecycle::Stopping => {
                warn!(
                    subsystem = "monitor",
                    component = "loop",
                    "Change monitor is stopping, start ignored"
                );
                return;
            }
            _ => {}
        }

        self.state_tx.send_replace(MonitorState::Starting);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let worker = Worker {
            config: self.config.clone(),
            parser: self.parser.clone(),
            dispatcher: self.dispatcher.clone(),
            receiver: self.receiver.clone(),
            state_tx: self.state_tx.clone(),
            stats: self.stats.clone(),
            dedup: Deduplicator::new(self.config.dedup_strategy, self.config.dedup_window),
        };
        let join = tokio::spawn(worker.run(cancel_rx));

        *lifecycle = Lifecycle::Running(Session { cancel_tx, join });
    }

    /// Stop the running session and close the queue connection.
    ///
    /// Waits up to the configured grace period for the loop to exit, then
    /// aborts it. Safe to call when already stopped. `start()` is refused
    /// until the stop completes.
    pub async fn stop(&self) {
        let _serial = self.stop_lock.lock().await;
        let session = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(session) => Some(session),
                _ => None,
            }
        };

        if let Some(Session {
            cancel_tx,
            mut join,
        }) = session
        {
            let started = Instant::now();
            self.state_tx.send_replace(MonitorState::Stopping);
            cancel_tx.send_replace(true);

            match tokio::time::timeout(self.config.stop_grace, &mut join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    subsystem = "monitor",
                    component = "loop",
                    error = %e,
                    "Change monitor task ended abnormally"
                ),
                Err(_) => {
                    warn!(
                        subsystem = "monitor",
                        component = "loop",
                        grace_ms = self.config.stop_grace.as_millis() as u64,
                        "Change monitor did not stop within grace period, aborting"
                    );
                    join.abort();
                    let _ = join.await;
                }
            }

            info!(
                subsystem = "monitor",
                component = "loop",
                op = "stop",
                duration_ms = started.elapsed().as_millis() as u64,
                "Change monitor stopped"
            );
        }

        self.receiver.lock().await.close().await;

        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        self.state_tx.send_replace(MonitorState::Stopped);
        *lifecycle = Lifecycle::Idle;
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        let lifecycle = std::mem::replace(
            self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner),
            Lifecycle::Idle,
        );
        if let Lifecycle::Running(session) = lifecycle {
            session.cancel_tx.send_replace(true);
            session.join.abort();
        }
    }
}

/// State owned by one session's task.
struct Worker {
    config: MonitorConfig,
    parser: PayloadParser,
    dispatcher: Arc<EventDispatcher>,
    receiver: SharedReceiver,
    state_tx: Arc<watch::Sender<MonitorState>>,
    stats: Arc<MonitorStats>,
    dedup: Deduplicator,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

impl Worker {
    async fn run(mut self, mut cancel_rx: watch::Receiver<bool>) {
        info!(
            subsystem = "monitor",
            component = "loop",
            op = "start",
            receive_timeout_ms = self.config.receive_timeout.as_millis() as u64,
            restart_delay_ms = self.config.restart_delay.as_millis() as u64,
            "Change monitor started"
        );
        self.state_tx.send_replace(MonitorState::Running);

        let mut attempt: u64 = 0;
        loop {
            if *cancel_rx.borrow() {
                break;
            }

            let failure = match AssertUnwindSafe(self.iterate()).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic),
            };

            error!(
                subsystem = "monitor",
                component = "loop",
                error = %failure,
                "Change monitor session failed"
            );
            self.receiver.lock().await.close().await;

            if *cancel_rx.borrow() {
                break;
            }
            self.state_tx.send_replace(MonitorState::Restarting);

            tokio::select! {
                _ = sleep(self.config.restart_delay) => {}
                _ = cancel_rx.changed() => break,
            }
            if *cancel_rx.borrow() {
                break;
            }

            attempt += 1;
            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            info!(
                subsystem = "monitor",
                component = "loop",
                op = "restart",
                attempt,
                "Restarting change monitor"
            );
            self.state_tx.send_replace(MonitorState::Running);
        }

        debug!(
            subsystem = "monitor",
            component = "loop",
            "Change monitor loop exited"
        );
    }

    /// One receive and the processing of whatever it returned.
    async fn iterate(&mut self) -> Result<()> {
        let outcome = {
            let mut receiver = self.receiver.lock().await;
            receiver.receive_once(self.config.receive_timeout).await
        };

        match outcome {
            ReceiveOutcome::Timeout => {
                trace!(subsystem = "monitor", component = "loop", "Receive timed out");
                Ok(())
            }
            ReceiveOutcome::ConnectionError(e) => Err(e),
            ReceiveOutcome::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_message(&mut self, message: QueueMessage) -> Result<()> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let Some(body) = message.body else {
            debug!(
                subsystem = "monitor",
                component = "loop",
                message_type = %message.message_type,
                "Skipping message without body"
            );
            return Ok(());
        };

        let parsed = match self.parser.parse(&body) {
            Ok(parsed) => parsed,
            Err(Error::Payload(reason)) => {
                warn!(
                    subsystem = "monitor",
                    component = "loop",
                    error = %reason,
                    "Discarding unreadable payload"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.stats
            .records_rejected
            .fetch_add(parsed.rejected.len() as u64, Ordering::Relaxed);

        for record in parsed.records {
            let kind = record.entity_kind();
            if self.dedup.check(kind, &record) {
                self.stats.records_suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subsystem = "monitor",
                    component = "dedup",
                    entity_kind = %kind,
                    entity_id = %record.entity_id,
                    occurred_at = %record.occurred_at,
                    "Suppressed near-duplicate change"
                );
                continue;
            }

            let event = self.dispatcher.publish(record).await?;
            self.stats.records_dispatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                subsystem = "monitor",
                component = "loop",
                entity_kind = %kind,
                entity_id = event.entity_id(),
                operation = %event.operation(),
                "Change dispatched"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{change_message, RecordingSubscriber, ScriptedReceiver, Step};
    use std::time::Duration;

    const DOC: &str = r#"<F_DOCENTETE><r OperationType="INSERT" RecordID="P1"
        ModificationTime="2024-01-01T00:00:00" Domaine="0" Type="6" TotalHT="150.00"/></F_DOCENTETE>"#;

    async fn monitor_with(
        receiver: ScriptedReceiver,
        config: MonitorConfig,
    ) -> (ChangeMonitor, Arc<RecordingSubscriber>) {
        let dispatcher = Arc::new(EventDispatcher::new());
        let recorder = Arc::new(RecordingSubscriber::new("recorder"));
        dispatcher.register(recorder.clone()).await;
        (
            ChangeMonitor::new(Box::new(receiver), dispatcher, config),
            recorder,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let receiver = ScriptedReceiver::new();
        let (monitor, _) = monitor_with(receiver.clone(), MonitorConfig::default()).await;

        monitor.start();
        monitor.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(monitor.is_running());
        assert_eq!(monitor.state(), MonitorState::Running);
        // A single session means a single outstanding receive.
        assert_eq!(receiver.call_count(), 1);

        monitor.stop().await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_monitor_does_not_start() {
        let receiver = ScriptedReceiver::new();
        let (monitor, _) =
            monitor_with(receiver.clone(), MonitorConfig::default().with_enabled(false)).await;
        monitor.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!monitor.is_running());
        assert_eq!(receiver.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_without_body_is_skipped() {
        let receiver = ScriptedReceiver::with_steps([
            Step::Message(QueueMessage {
                message_type: "EndDialog".to_string(),
                conversation_group_id: None,
                body: None,
            }),
            Step::Message(change_message(DOC)),
        ]);
        let (monitor, recorder) = monitor_with(receiver, MonitorConfig::default()).await;
        monitor.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        monitor.stop().await;

        assert_eq!(recorder.events().len(), 1);
        let stats = monitor.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.records_dispatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_payload_does_not_restart() {
        let receiver = ScriptedReceiver::with_steps([
            Step::Message(change_message("<F_DOCENTETE>")),
            Step::Message(change_message(DOC)),
        ]);
        let (monitor, recorder) = monitor_with(receiver.clone(), MonitorConfig::default()).await;
        monitor.start();
        tokio::time::sleep(Duration::from_millis(1)).await;
        monitor.stop().await;

        assert_eq!(recorder.events().len(), 1);
        assert_eq!(monitor.stats().restarts, 0);
        assert_eq!(receiver.opens(), 1);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "panic: boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "panic: bang");
        assert_eq!(panic_message(Box::new(7u8)), "panic");
    }
}
