//! Monitor configuration.

use std::time::Duration;

use sage_core::defaults::{
    DEDUP_WINDOW_MS, RECEIVE_TIMEOUT_MS, RELAY_INTERVAL_MS, RELAY_RECENT_CAPACITY,
    RESTART_DELAY_MS, STOP_GRACE_MS,
};
use sage_core::{Error, Result};

/// How near-duplicate notifications are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupStrategy {
    /// Remember only the last non-suppressed record per entity kind.
    #[default]
    LastRecord,
    /// Remember every identity seen within the window.
    Windowed,
}

impl DedupStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last_record" | "last-record" | "single" => Ok(DedupStrategy::LastRecord),
            "windowed" | "window" => Ok(DedupStrategy::Windowed),
            other => Err(Error::Config(format!("unknown dedup strategy: {}", other))),
        }
    }
}

/// Configuration for the change monitor and its relay.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Whether the monitor should be started at all.
    pub enabled: bool,
    /// Maximum wait of a single queue receive.
    pub receive_timeout: Duration,
    /// Delay before a failed session is restarted.
    pub restart_delay: Duration,
    /// How long `stop()` waits for the loop to exit before aborting it.
    pub stop_grace: Duration,
    /// Near-duplicate suppression window.
    pub dedup_window: Duration,
    pub dedup_strategy: DedupStrategy,
    /// Root tags decoded as generic table changes.
    pub table_tags: Vec<String>,
    /// Period of the UI relay drain.
    pub relay_interval: Duration,
    /// Size of the recent-changes ring kept by the relay.
    pub relay_recent_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            receive_timeout: Duration::from_millis(RECEIVE_TIMEOUT_MS),
            restart_delay: Duration::from_millis(RESTART_DELAY_MS),
            stop_grace: Duration::from_millis(STOP_GRACE_MS),
            dedup_window: Duration::from_millis(DEDUP_WINDOW_MS),
            dedup_strategy: DedupStrategy::LastRecord,
            table_tags: Vec::new(),
            relay_interval: Duration::from_millis(RELAY_INTERVAL_MS),
            relay_recent_capacity: RELAY_RECENT_CAPACITY,
        }
    }
}

impl MonitorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `MONITOR_ENABLED` | `true` | Enable/disable the monitor |
    /// | `MONITOR_RECEIVE_TIMEOUT_MS` | `30000` | Queue receive wait |
    /// | `MONITOR_RESTART_DELAY_MS` | `5000` | Delay before restarting a failed session |
    /// | `MONITOR_STOP_GRACE_MS` | `5000` | Stop grace period |
    /// | `MONITOR_DEDUP_WINDOW_MS` | `2000` | Suppression window |
    /// | `MONITOR_DEDUP_STRATEGY` | `last_record` | `last_record` or `windowed` |
    /// | `MONITOR_TABLE_TAGS` | (empty) | Comma-separated generic table root tags |
    /// | `RELAY_INTERVAL_MS` | `500` | UI relay drain period |
    /// | `RELAY_RECENT_CAPACITY` | `100` | Recent changes kept by the relay |
    ///
    /// Unparseable numbers fall back to their default. An unknown dedup
    /// strategy or a zero receive timeout / relay interval is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let millis = |name: &str, default: u64| {
            let ms = lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default);
            Duration::from_millis(ms)
        };

        let enabled = lookup("MONITOR_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let dedup_strategy = match lookup("MONITOR_DEDUP_STRATEGY") {
            Some(v) if !v.trim().is_empty() => DedupStrategy::parse(&v)?,
            _ => DedupStrategy::default(),
        };

        let table_tags = lookup("MONITOR_TABLE_TAGS")
            .map(|v| parse_tag_list(&v))
            .unwrap_or_default();

        let relay_recent_capacity = lookup("RELAY_RECENT_CAPACITY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(RELAY_RECENT_CAPACITY)
            .max(1);

        let config = Self {
            enabled,
            receive_timeout: millis("MONITOR_RECEIVE_TIMEOUT_MS", RECEIVE_TIMEOUT_MS),
            restart_delay: millis("MONITOR_RESTART_DELAY_MS", RESTART_DELAY_MS),
            stop_grace: millis("MONITOR_STOP_GRACE_MS", STOP_GRACE_MS),
            dedup_window: millis("MONITOR_DEDUP_WINDOW_MS", DEDUP_WINDOW_MS),
            dedup_strategy,
            table_tags,
            relay_interval: millis("RELAY_INTERVAL_MS", RELAY_INTERVAL_MS),
            relay_recent_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject periods the loop and relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.receive_timeout.is_zero() {
            return Err(Error::Config(
                "MONITOR_RECEIVE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }
        if self.relay_interval.is_zero() {
            return Err(Error::Config(
                "RELAY_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_dedup_strategy(mut self, strategy: DedupStrategy) -> Self {
        self.dedup_strategy = strategy;
        self
    }

    /// Register an additional generic table root tag.
    pub fn with_table_tag(mut self, tag: impl Into<String>) -> Self {
        self.table_tags.push(tag.into());
        self
    }

    pub fn with_relay_interval(mut self, interval: Duration) -> Self {
        self.relay_interval = interval;
        self
    }

    pub fn with_relay_recent_capacity(mut self, capacity: usize) -> Self {
        self.relay_recent_capacity = capacity.max(1);
        self
    }
}

fn parse_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
