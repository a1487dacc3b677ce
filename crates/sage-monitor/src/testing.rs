//! Test doubles for the ingestion pipeline.
//!
//! Always compiled so integration tests (in tests/) and downstream crates can
//! drive a [`ChangeMonitor`](crate::ChangeMonitor) without a queue server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use sage_core::defaults::CHANGE_MESSAGE_TYPE;
use sage_core::{
    DomainEvent, EntityKind, Error, QueueMessage, QueueReceiver, ReceiveOutcome, Result,
};

use crate::dispatcher::ChangeSubscriber;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue message of the change type carrying `body`.
pub fn change_message(body: impl Into<String>) -> QueueMessage {
    QueueMessage {
        message_type: CHANGE_MESSAGE_TYPE.to_string(),
        conversation_group_id: None,
        body: Some(body.into()),
    }
}

/// One scripted receive.
#[derive(Debug, Clone)]
pub enum Step {
    Message(QueueMessage),
    /// Return `Timeout` immediately.
    Timeout,
    ConnectionError(String),
    /// Never return; the caller has to give up on the receive.
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    calls: Vec<Instant>,
    open: bool,
    opens: usize,
    close_calls: usize,
}

/// Receiver replaying a script of outcomes.
///
/// Clones share the script, so a test keeps one handle for inspection while
/// the monitor owns another. Once the script is exhausted the receiver
/// behaves like an idle queue: it waits out the timeout and reports
/// `Timeout`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReceiver {
    script: Arc<Mutex<Script>>,
}

impl ScriptedReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        let receiver = Self::new();
        lock(&receiver.script).steps.extend(steps);
        receiver
    }

    /// Append a step to the script.
    pub fn push(&self, step: Step) {
        lock(&self.script).steps.push_back(step);
    }

    /// Instants at which `receive_once` was entered.
    pub fn calls(&self) -> Vec<Instant> {
        lock(&self.script).calls.clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.script).calls.len()
    }

    /// Number of connections opened so far.
    pub fn opens(&self) -> usize {
        lock(&self.script).opens
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.script).close_calls
    }

    pub fn remaining_steps(&self) -> usize {
        lock(&self.script).steps.len()
    }
}

#[async_trait]
impl QueueReceiver for ScriptedReceiver {
    async fn receive_once(&mut self, timeout: Duration) -> ReceiveOutcome {
        let step = {
            let mut script = lock(&self.script);
            script.calls.push(Instant::now());
            if !script.open {
                script.open = true;
                script.opens += 1;
            }
            script.steps.pop_front()
        };

        match step {
            Some(Step::Message(message)) => ReceiveOutcome::Message(message),
            Some(Step::Timeout) => ReceiveOutcome::Timeout,
            Some(Step::ConnectionError(reason)) => {
                lock(&self.script).open = false;
                ReceiveOutcome::ConnectionError(Error::Connection(reason))
            }
            Some(Step::Hang) => {
                futures::future::pending::<()>().await;
                ReceiveOutcome::Timeout
            }
            None => {
                tokio::time::sleep(timeout).await;
                ReceiveOutcome::Timeout
            }
        }
    }

    async fn close(&mut self) {
        let mut script = lock(&self.script);
        script.close_calls += 1;
        script.open = false;
    }

    fn is_open(&self) -> bool {
        lock(&self.script).open
    }
}

/// Log shared by several recording subscribers: `(subscriber, event)`.
pub type SharedLog = Arc<Mutex<Vec<(String, DomainEvent)>>>;

/// Subscriber that records every event it receives.
pub struct RecordingSubscriber {
    name: String,
    kinds: Option<Vec<EntityKind>>,
    events: Mutex<Vec<DomainEvent>>,
    log: Option<SharedLog>,
}

impl RecordingSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kinds: None,
            events: Mutex::new(Vec::new()),
            log: None,
        }
    }

    pub fn shared_log() -> SharedLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Recorder that also appends to a log shared with other recorders.
    pub fn with_log(name: impl Into<String>, log: SharedLog) -> Self {
        Self {
            log: Some(log),
            ..Self::new(name)
        }
    }

    /// Only accept the given kinds.
    pub fn accepting(mut self, kinds: &[EntityKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl ChangeSubscriber for RecordingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, kind: EntityKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }

    async fn on_change(&self, event: &DomainEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        if let Some(log) = &self.log {
            lock(log).push((self.name.clone(), event.clone()));
        }
        Ok(())
    }
}

/// Subscriber that fails, either always or for its first `n` events.
pub struct FailingSubscriber {
    name: String,
    remaining_failures: Option<AtomicUsize>,
    attempts: AtomicUsize,
}

impl FailingSubscriber {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remaining_failures: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` events, then succeed.
    pub fn failing_first(name: impl Into<String>, n: usize) -> Self {
        Self {
            remaining_failures: Some(AtomicUsize::new(n)),
            ..Self::new(name)
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSubscriber for FailingSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_change(&self, event: &DomainEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = match &self.remaining_failures {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        };
        if fail {
            return Err(Error::Internal(format!(
                "{} rejected {}",
                self.name,
                event.entity_id()
            )));
        }
        Ok(())
    }
}

/// Subscriber that panics on every event.
pub struct PanickingSubscriber;

#[async_trait]
impl ChangeSubscriber for PanickingSubscriber {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn on_change(&self, event: &DomainEvent) -> Result<()> {
        panic!("subscriber panicked on {}", event.entity_id());
    }
}
