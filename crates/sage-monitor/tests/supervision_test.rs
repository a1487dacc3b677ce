//! Supervision behaviour of the change monitor: restart after failure,
//! cancellation, and bounded stop.
//!
//! All tests run on a paused clock so delays are exact.

use std::sync::Arc;
use std::time::Duration;

use sage_monitor::testing::{
    change_message, FailingSubscriber, PanickingSubscriber, RecordingSubscriber,
    ScriptedReceiver, Step,
};
use sage_monitor::{ChangeMonitor, EventDispatcher, MonitorConfig, MonitorState, QueueReceiver};
use tokio::time::Instant;

const DOC_AT_0S: &str = r#"<F_DOCENTETE><r OperationType="UPDATE" RecordID="FA1"
    ModificationTime="2024-01-01T00:00:00" Domaine="0" Type="6" TotalHT="10.00"/></F_DOCENTETE>"#;
const DOC_AT_1S: &str = r#"<F_DOCENTETE><r OperationType="UPDATE" RecordID="FA1"
    ModificationTime="2024-01-01T00:00:01" Domaine="0" Type="6" TotalHT="11.00"/></F_DOCENTETE>"#;

fn monitor(receiver: &ScriptedReceiver, dispatcher: Arc<EventDispatcher>) -> ChangeMonitor {
    ChangeMonitor::new(
        Box::new(receiver.clone()),
        dispatcher,
        MonitorConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_exact_restart_delay() {
    let receiver = ScriptedReceiver::with_steps([
        Step::ConnectionError("connection reset".into()),
        Step::Timeout,
    ]);
    let monitor = monitor(&receiver, Arc::new(EventDispatcher::new()));

    monitor.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.state(), MonitorState::Restarting);
    assert_eq!(receiver.call_count(), 1);
    assert_eq!(receiver.close_calls(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let calls = receiver.calls();
    assert!(calls.len() >= 2, "expected a reconnect, got {:?}", calls);
    assert_eq!(calls[1] - calls[0], Duration::from_secs(5));
    assert_eq!(receiver.opens(), 2);
    assert_eq!(monitor.state(), MonitorState::Running);
    assert_eq!(monitor.stats().restarts, 1);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restarts_are_unbounded() {
    let receiver = ScriptedReceiver::with_steps(
        (0..4).map(|i| Step::ConnectionError(format!("failure {}", i))),
    );
    let monitor = monitor(&receiver, Arc::new(EventDispatcher::new()));

    monitor.start();
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(monitor.stats().restarts, 4);
    assert!(monitor.is_running());
    assert_eq!(monitor.state(), MonitorState::Running);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_restart_delay_prevents_reconnect() {
    let receiver = ScriptedReceiver::with_steps([Step::ConnectionError("refused".into())]);
    let monitor = monitor(&receiver, Arc::new(EventDispatcher::new()));

    monitor.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.state(), MonitorState::Restarting);

    let started = Instant::now();
    monitor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(monitor.state(), MonitorState::Stopped);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(receiver.call_count(), 1);
    assert!(!receiver.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_outstanding_receive_is_bounded_by_grace() {
    let receiver = ScriptedReceiver::with_steps([Step::Hang]);
    let monitor = monitor(&receiver, Arc::new(EventDispatcher::new()));

    monitor.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(receiver.is_open());

    let started = Instant::now();
    monitor.stop().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(5) + Duration::from_millis(100));

    assert!(!receiver.is_open());
    assert!(!monitor.is_running());
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let receiver = ScriptedReceiver::new();
    let monitor = monitor(&receiver, Arc::new(EventDispatcher::new()));

    monitor.stop().await;
    monitor.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    monitor.stop().await;
    monitor.stop().await;
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert!(!receiver.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_starts_new_session() {
    let receiver = ScriptedReceiver::new();
    let monitor = monitor(&receiver, Arc::new(EventDispatcher::new()));

    monitor.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    monitor.stop().await;

    monitor.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(monitor.is_running());
    assert_eq!(receiver.opens(), 2);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_subscriber_restarts_loop() {
    let receiver = ScriptedReceiver::with_steps([
        Step::Message(change_message(DOC_AT_0S)),
        Step::Timeout,
    ]);
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher.register(Arc::new(PanickingSubscriber)).await;
    let monitor = monitor(&receiver, dispatcher);

    monitor.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.state(), MonitorState::Restarting);
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(monitor.stats().restarts, 1);
    assert_eq!(receiver.call_count(), 3);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_failure_restarts_and_keeps_dedup_state() {
    let receiver = ScriptedReceiver::with_steps([
        Step::Message(change_message(DOC_AT_0S)),
        Step::Message(change_message(DOC_AT_1S)),
    ]);
    let recorder = Arc::new(RecordingSubscriber::new("recorder"));
    let flaky = Arc::new(FailingSubscriber::failing_first("flaky", 1));
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher.register(recorder.clone()).await;
    dispatcher.register(flaky.clone()).await;
    let monitor = monitor(&receiver, dispatcher);

    monitor.start();
    tokio::time::sleep(Duration::from_secs(6)).await;

    // The failed event reached the recorder; the 1s repeat after the
    // restart is still within the window of the first.
    assert_eq!(recorder.events().len(), 1);
    assert_eq!(flaky.attempts(), 1);
    let stats = monitor.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.records_suppressed, 1);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_during_stop_grace_is_ignored() {
    let receiver = ScriptedReceiver::with_steps([Step::Hang]);
    let monitor = Arc::new(monitor(&receiver, Arc::new(EventDispatcher::new())));

    monitor.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopping = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.stop().await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.state(), MonitorState::Stopping);

    monitor.start();
    assert_eq!(monitor.state(), MonitorState::Stopping);

    stopping.await.unwrap();
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert!(!monitor.is_running());
    assert!(!receiver.is_open());
    assert_eq!(receiver.opens(), 1);

    // Once stopped, a new session can start.
    monitor.start();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(monitor.is_running());
    assert_eq!(receiver.opens(), 2);
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_receive_timeout_does_not_start() {
    let receiver = ScriptedReceiver::new();
    let monitor = ChangeMonitor::new(
        Box::new(receiver.clone()),
        Arc::new(EventDispatcher::new()),
        MonitorConfig::default().with_receive_timeout(Duration::ZERO),
    );

    monitor.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!monitor.is_running());
    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(receiver.call_count(), 0);
}
