//! sage-supervisor service entry point.
//!
//! Wires the queue receiver, the persistence and relay subscribers, and the
//! change monitor, then runs until interrupted.

mod config;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sage_core::{ChangeEnvelope, ChangeRepository, EventBus};
use sage_db::{Database, MemoryChangeRepository, PgQueueReceiver, PoolConfig};
use sage_monitor::{
    ChangeMonitor, ChangeRelay, EventDispatcher, MonitorConfig, PersistenceSubscriber,
};

use crate::config::{ServiceConfig, StoreBackend};

/// Interval of the health log line.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "sage_supervisor=info,sage_monitor=info,sage_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sage_supervisor=info,sage_monitor=info,sage_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("sage-supervisor.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let service = ServiceConfig::from_env()?;
    let monitor_config = MonitorConfig::from_env()?;

    // Persistence backend
    let store_db = match service.store_backend {
        StoreBackend::Postgres => {
            info!("Connecting to store database...");
            let db = Database::connect_with_config(
                &service.store_database_url,
                PoolConfig::new(service.db_max_connections),
            )
            .await?;
            info!("Running database migrations...");
            db.migrate().await?;
            info!("Database migrations complete");
            Some(db)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory change store, nothing will be persisted");
            None
        }
    };
    let repository: Arc<dyn ChangeRepository> = match &store_db {
        Some(db) => Arc::new(db.changes.clone()),
        None => Arc::new(MemoryChangeRepository::new()),
    };

    // Subscribers, in delivery order
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher
        .register(Arc::new(PersistenceSubscriber::new(repository)))
        .await;
    let relay = Arc::new(ChangeRelay::new(monitor_config.relay_recent_capacity));
    dispatcher.register(relay.clone()).await;

    // UI feed
    let event_bus = EventBus::default();
    tokio::spawn(log_notifications(event_bus.subscribe()));
    let relay_handle = relay.spawn(event_bus.clone(), monitor_config.relay_interval)?;

    let receiver = PgQueueReceiver::new(&service.queue_database_url);
    let monitor = Arc::new(ChangeMonitor::new(
        Box::new(receiver),
        dispatcher,
        monitor_config,
    ));
    monitor.start();

    let health = tokio::spawn(log_health(monitor.clone(), store_db.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    health.abort();
    monitor.stop().await;
    relay_handle.shutdown().await?;

    let stats = monitor.stats();
    info!(
        messages_received = stats.messages_received,
        records_dispatched = stats.records_dispatched,
        records_suppressed = stats.records_suppressed,
        records_rejected = stats.records_rejected,
        restarts = stats.restarts,
        relayed = relay.relayed_count(),
        "sage-supervisor stopped"
    );
    if let Some(db) = &store_db {
        db.pool().close().await;
    }

    Ok(())
}

/// Log every change relayed to the UI feed.
async fn log_notifications(mut rx: tokio::sync::broadcast::Receiver<ChangeEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                info!(
                    subsystem = "relay",
                    event_type = %envelope.event_type,
                    entity_id = %envelope.entity_id,
                    label = envelope.label.as_deref().unwrap_or("-"),
                    operation = %envelope.payload.operation(),
                    "Change notification"
                );
                if let Ok(json) = serde_json::to_string(&envelope) {
                    debug!(subsystem = "relay", payload = %json, "Change notification payload");
                }
            }
            Err(RecvError::Lagged(n)) => {
                warn!(missed = n, "Notification log lagged, missed events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Periodic monitor and pool health line.
async fn log_health(monitor: Arc<ChangeMonitor>, store_db: Option<Database>) {
    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = monitor.stats();
        let pool = store_db.as_ref().map(Database::pool_usage);
        info!(
            subsystem = "monitor",
            state = ?monitor.state(),
            messages_received = stats.messages_received,
            records_dispatched = stats.records_dispatched,
            records_suppressed = stats.records_suppressed,
            restarts = stats.restarts,
            pool_in_use = pool.map(|u| u.in_use()),
            pool_max = pool.map(|u| u.max),
            "Monitor health"
        );
    }
}
