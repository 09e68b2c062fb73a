//! Library-wide defaults for chatlink.
//!
//! This module centralizes the magic numbers used by the connection
//! manager, dispatch pipeline, router and history loader. Every value here
//! is a *default*: [`crate::config::ClientConfig`] can override them.
//!
//! # Categories
//!
//! - **Heartbeat**: liveness probing on an open socket
//! - **Reconnection**: the canonical backoff policy
//! - **Dispatch**: outbound retry budget and queue bounds
//! - **Router / History**: dedup window and page sizes
//! - **Telemetry**: sliding windows and health thresholds

use std::time::Duration;

// ============================================================================
// Heartbeat
// ============================================================================

/// Interval between client pings on an open connection.
///
/// Each tick sends `{type: "ping", ts}` and counts the previous ping as
/// missed if no matching pong arrived in the meantime.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Consecutive missed pongs that move `open` to `degraded`.
pub const DEGRADED_AFTER_MISSED: u32 = 2;

/// Consecutive missed pongs that force-close the transport.
///
/// The heartbeat miss threshold doubles as the liveness timeout; there is
/// no separate socket read timeout.
pub const FORCE_CLOSE_AFTER_MISSED: u32 = 4;

// ============================================================================
// Reconnection
// ============================================================================

/// First reconnect delay.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(3);

/// Growth factor applied per failed attempt.
pub const RECONNECT_MULTIPLIER: f64 = 1.5;

/// Upper bound for any reconnect delay, jitter included.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Failed attempts tolerated before the connection gives up and closes.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Frames held while the socket is not open (oldest dropped on overflow).
pub const OUTBOUND_BUFFER_CAPACITY: usize = 100;

// ============================================================================
// Dispatch
// ============================================================================

/// Retries after the first failed attempt before a message is marked failed.
pub const DISPATCH_MAX_RETRIES: u32 = 2;

/// Base retry delay; the actual delay is `base * attempt`.
pub const DISPATCH_RETRY_DELAY: Duration = Duration::from_millis(800);

/// Maximum number of messages waiting in the delivery queue.
pub const DISPATCH_QUEUE_CAPACITY: usize = 256;

/// Content characters that take part in a send fingerprint.
pub const FINGERPRINT_CONTENT_CHARS: usize = 32;

/// A send matching an unconfirmed message's fingerprint within this window
/// returns that message instead of creating a new one.
pub const DUPLICATE_SEND_WINDOW: Duration = Duration::from_secs(1);

/// HTTP client request timeout for REST calls.
///
/// Applies to the send fallback and to history page fetches.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Router / History
// ============================================================================

/// Number of recent inbound event keys remembered for dedup.
pub const RECENT_EVENT_WINDOW: usize = 50;

/// Hex characters kept from the payload digest when a frame carries no id.
pub const PAYLOAD_HASH_PREFIX_LEN: usize = 16;

/// Default history page size.
pub const DEFAULT_PAGE_SIZE: usize = 30;

/// Capacity of the broadcast channels used for store and dispatch events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Telemetry
// ============================================================================

/// RTT samples retained for percentile and jitter computation.
pub const RTT_SAMPLE_CAPACITY: usize = 120;

/// Sliding windows for event rate tracking, shortest first.
///
/// The shortest window is the spike probe; the longest is the baseline.
pub const RATE_WINDOWS: [Duration; 3] = [
    Duration::from_secs(10),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

/// Spike factor (short rate / baseline rate) that flags a spike.
pub const SPIKE_FACTOR_MIN: f64 = 2.5;

/// Minimum short-window rate (events per second) for a spike to count.
pub const SPIKE_RATE_MIN: f64 = 0.2;
