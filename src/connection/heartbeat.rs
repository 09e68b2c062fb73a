//! Heartbeat ping/pong bookkeeping.
//!
//! Pure state, driven by the connection manager's ticker. At each tick the
//! previous ping counts as missed if its pong has not arrived; a pong
//! echoing the outstanding ping's timestamp yields an RTT sample and clears
//! the miss counter.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Result of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Below the degraded threshold.
    Healthy {
        /// Consecutive misses (may be non-zero but under the threshold).
        missed: u32,
    },
    /// At or above the degraded threshold.
    Degraded {
        /// Consecutive misses.
        missed: u32,
    },
    /// Force-close threshold reached; the transport should be dropped.
    Dead {
        /// Consecutive misses.
        missed: u32,
    },
}

/// Tracks outstanding pings and consecutive misses for one open transport.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    degraded_after: u32,
    force_close_after: u32,
    outstanding: Option<(i64, Instant)>,
    missed: u32,
    last_rtt: Option<Duration>,
    last_sent_at: Option<DateTime<Utc>>,
    last_ack_at: Option<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    /// Create a monitor with the given miss thresholds.
    pub fn new(degraded_after: u32, force_close_after: u32) -> Self {
        Self {
            degraded_after: degraded_after.max(1),
            force_close_after: force_close_after.max(degraded_after.max(1)),
            outstanding: None,
            missed: 0,
            last_rtt: None,
            last_sent_at: None,
            last_ack_at: None,
        }
    }

    /// Forget everything about the previous transport.
    pub fn reset(&mut self) {
        self.outstanding = None;
        self.missed = 0;
    }

    /// Register a tick: account for the previous ping, then record a new
    /// one sent with timestamp `ts` at `now`.
    pub fn on_tick(&mut self, ts: i64, now: Instant) -> HeartbeatVerdict {
        if self.outstanding.is_some() {
            self.missed += 1;
        }
        self.outstanding = Some((ts, now));
        self.last_sent_at = Some(Utc::now());

        if self.missed >= self.force_close_after {
            HeartbeatVerdict::Dead {
                missed: self.missed,
            }
        } else if self.missed >= self.degraded_after {
            HeartbeatVerdict::Degraded {
                missed: self.missed,
            }
        } else {
            HeartbeatVerdict::Healthy {
                missed: self.missed,
            }
        }
    }

    /// Register a pong. Returns the RTT if it answers the outstanding ping.
    pub fn on_pong(&mut self, ts: i64, now: Instant) -> Option<Duration> {
        let (sent_ts, sent_at) = self.outstanding?;
        if sent_ts != ts {
            return None;
        }
        let rtt = now.saturating_duration_since(sent_at);
        self.outstanding = None;
        self.missed = 0;
        self.last_rtt = Some(rtt);
        self.last_ack_at = Some(Utc::now());
        Some(rtt)
    }

    /// Consecutive unanswered pings.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Most recent RTT sample.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Wall-clock time of the last ping sent.
    pub fn last_sent_at(&self) -> Option<DateTime<Utc>> {
        self.last_sent_at
    }

    /// Wall-clock time of the last matching pong.
    pub fn last_ack_at(&self) -> Option<DateTime<Utc>> {
        self.last_ack_at
    }
}
