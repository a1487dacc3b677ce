//! Transactional change queue.
//!
//! Upstream triggers insert one row per change notification into the queue
//! table, and an `AFTER INSERT` trigger raises `NOTIFY` on the queue channel.
//! The receiver holds a single dedicated connection: it `LISTEN`s on that
//! channel and takes rows off the queue with `DELETE ... RETURNING`, so a
//! message is only ever delivered once.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{Pool, Postgres};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sage_core::defaults::{QUEUE_CHANNEL, QUEUE_TABLE};
use sage_core::{Error, QueueMessage, QueueReceiver, ReceiveOutcome, Result};

/// Lifecycle of the receiver's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Receiving,
}

/// Blocking receiver over the PostgreSQL change queue.
pub struct PgQueueReceiver {
    url: String,
    channel: String,
    dequeue_sql: String,
    listener: Option<PgListener>,
    state: ConnectionState,
}

impl PgQueueReceiver {
    /// Receiver for the default queue table and channel.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_queue(url, QUEUE_TABLE, QUEUE_CHANNEL)
    }

    /// Receiver for a specific queue table and notification channel.
    pub fn with_queue(url: impl Into<String>, table: &str, channel: &str) -> Self {
        let dequeue_sql = format!(
            r#"
            DELETE FROM {table}
            WHERE id = (
                SELECT id FROM {table}
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING conversation_group_id, message_type, message_body
            "#
        );
        Self {
            url: url.into(),
            channel: channel.to_string(),
            dequeue_sql,
            listener: None,
            state: ConnectionState::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let mut listener = PgListener::connect(&self.url)
            .await
            .map_err(|e| Error::Connection(format!("queue connect failed: {}", e)))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| Error::Connection(format!("queue listen failed: {}", e)))?;

        info!(
            subsystem = "queue",
            component = "receiver",
            op = "connect",
            channel = %self.channel,
            "Queue connection opened"
        );
        self.listener = Some(listener);
        Ok(())
    }
}

/// Take the oldest message off the queue, if any.
async fn dequeue(listener: &mut PgListener, sql: &str) -> Result<Option<QueueMessage>> {
    let row: Option<(Option<Uuid>, String, Option<String>)> = sqlx::query_as(sql)
        .fetch_optional(&mut *listener)
        .await
        .map_err(Error::Database)?;

    Ok(row.map(
        |(conversation_group_id, message_type, body)| QueueMessage {
            message_type,
            conversation_group_id,
            body,
        },
    ))
}

/// Poll the queue, sleeping on the notification channel between polls until
/// a message arrives or `timeout` elapses.
async fn wait_for_message(
    listener: &mut PgListener,
    sql: &str,
    timeout: Duration,
) -> Result<Option<QueueMessage>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(message) = dequeue(listener, sql).await? {
            return Ok(Some(message));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        match tokio::time::timeout(remaining, listener.try_recv()).await {
            Err(_) => return Ok(None),
            Ok(Ok(Some(_notification))) => continue,
            Ok(Ok(None)) => {
                return Err(Error::Connection(
                    "queue connection closed by server".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(Error::Database(e)),
        }
    }
}

#[async_trait]
impl QueueReceiver for PgQueueReceiver {
    async fn receive_once(&mut self, timeout: Duration) -> ReceiveOutcome {
        if let Err(e) = self.ensure_connected().await {
            self.state = ConnectionState::Idle;
            warn!(
                subsystem = "queue",
                component = "receiver",
                op = "connect",
                error = %e,
                "Queue connection failed"
            );
            return ReceiveOutcome::ConnectionError(e);
        }

        self.state = ConnectionState::Receiving;
        let Some(listener) = self.listener.as_mut() else {
            self.state = ConnectionState::Idle;
            return ReceiveOutcome::ConnectionError(Error::Connection(
                "queue connection unavailable".to_string(),
            ));
        };

        match wait_for_message(listener, &self.dequeue_sql, timeout).await {
            Ok(Some(message)) => {
                debug!(
                    subsystem = "queue",
                    component = "receiver",
                    op = "receive",
                    message_type = %message.message_type,
                    "Queue message received"
                );
                ReceiveOutcome::Message(message)
            }
            Ok(None) => ReceiveOutcome::Timeout,
            Err(e) => {
                // A broken connection is never reused.
                self.listener = None;
                self.state = ConnectionState::Idle;
                ReceiveOutcome::ConnectionError(e)
            }
        }
    }

    async fn close(&mut self) {
        if self.listener.take().is_some() {
            debug!(
                subsystem = "queue",
                component = "receiver",
                op = "close",
                "Queue connection closed"
            );
        }
        self.state = ConnectionState::Idle;
    }

    fn is_open(&self) -> bool {
        self.listener.is_some()
    }
}

/// Producer side of the change queue.
///
/// Production traffic is written by database triggers upstream; this is used
/// by tooling and integration tests.
#[derive(Clone)]
pub struct PgChangeQueue {
    pool: Pool<Postgres>,
}

impl PgChangeQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Enqueue one message; returns the queue row id.
    pub async fn enqueue(
        &self,
        message_type: &str,
        body: Option<&str>,
        conversation_group_id: Option<Uuid>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO change_queue (conversation_group_id, message_type, message_body)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(conversation_group_id)
        .bind(message_type)
        .bind(body)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "queue",
            component = "producer",
            op = "enqueue",
            id,
            message_type,
            "Queue message enqueued"
        );
        Ok(id)
    }

    /// Number of messages waiting.
    pub async fn depth(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM change_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_receiver_is_idle() {
        let receiver = PgQueueReceiver::new("postgres://localhost/none");
        assert_eq!(receiver.state(), ConnectionState::Idle);
        assert!(!receiver.is_open());
    }

    #[test]
    fn test_dequeue_sql_targets_table() {
        let receiver = PgQueueReceiver::with_queue("postgres://x", "custom_queue", "custom");
        assert!(receiver.dequeue_sql.contains("DELETE FROM custom_queue"));
        assert!(receiver.dequeue_sql.contains("SKIP LOCKED"));
        assert_eq!(receiver.channel, "custom");
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_connection_error() {
        // Port 1 is never a PostgreSQL server.
        let mut receiver = PgQueueReceiver::new("postgres://sage@127.0.0.1:1/sage");
        let outcome = receiver.receive_once(Duration::from_millis(100)).await;
        match outcome {
            ReceiveOutcome::ConnectionError(e) => assert!(e.is_transient()),
            other => panic!("Expected ConnectionError, got {:?}", other),
        }
        assert!(!receiver.is_open());
        assert_eq!(receiver.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut receiver = PgQueueReceiver::new("postgres://localhost/none");
        receiver.close().await;
        receiver.close().await;
        assert!(!receiver.is_open());
    }
}
