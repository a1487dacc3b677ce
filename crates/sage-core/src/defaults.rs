//! Centralized default constants for sage-supervisor.
//!
//! All crates and the supervisor binary reference these constants instead of
//! defining their own magic numbers. Organized by subsystem.

// =============================================================================
// QUEUE
// =============================================================================

/// How long a single receive waits for the next queue item (milliseconds).
pub const RECEIVE_TIMEOUT_MS: u64 = 30_000;

/// Queue table holding pending change messages.
pub const QUEUE_TABLE: &str = "change_queue";

/// LISTEN/NOTIFY channel signalled when a message is enqueued.
pub const QUEUE_CHANNEL: &str = "change_queue";

/// Message type of ordinary change notifications.
pub const CHANGE_MESSAGE_TYPE: &str = "TableModification";

// =============================================================================
// SUPERVISION
// =============================================================================

/// Delay before the monitor restarts after a failure (milliseconds).
pub const RESTART_DELAY_MS: u64 = 5_000;

/// Grace period `stop()` waits for the loop to exit (milliseconds).
pub const STOP_GRACE_MS: u64 = 5_000;

// =============================================================================
// DEDUPLICATION
// =============================================================================

/// Trailing window within which a repeat for the same identity is suppressed.
pub const DEDUP_WINDOW_MS: u64 = 2_000;

// =============================================================================
// RELAY
// =============================================================================

/// Interval at which dispatched events are re-published to UI consumers.
pub const RELAY_INTERVAL_MS: u64 = 500;

/// Number of recently relayed events kept for snapshots.
pub const RELAY_RECENT_CAPACITY: usize = 100;

/// Event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Default database URL when `DATABASE_URL` is not set.
pub const DATABASE_URL: &str = "postgres://localhost/sage";

/// Default maximum number of pooled store connections.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Default connection timeout in seconds.
pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle timeout in seconds.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;
