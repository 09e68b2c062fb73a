//! Read-side telemetry aggregator.
//!
//! Core components report [`TelemetryEvent`]s through a [`Recorder`]. A
//! disabled recorder is a no-op, and the aggregator never feeds anything
//! back into the core, so turning telemetry off cannot change delivery
//! behavior.
//!
//! # Derived indicators
//!
//! - **Success rate**: connect successes / connect attempts
//! - **Jitter**: mean absolute difference between consecutive RTT samples
//! - **Spike factor**: shortest-window event rate / longest-window baseline
//! - **Health score**: weighted blend of reconnect, heartbeat, spike and
//!   recovery sub-scores, 0-100

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::constants::{RATE_WINDOWS, RTT_SAMPLE_CAPACITY, SPIKE_FACTOR_MIN, SPIKE_RATE_MIN};

/// Upper bound on remembered event arrival times.
const EVENT_TIME_CAPACITY: usize = 10_000;

/// Failure streak that zeroes the streak component of the reconnect score.
const STREAK_NORMALIZER: f64 = 5.0;

/// Sub-score weights: reconnect, heartbeat, spikes, recovery.
const HEALTH_WEIGHTS: (f64, f64, f64, f64) = (0.35, 0.35, 0.20, 0.10);

/// Counter increments reported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// A connect attempt started.
    ConnectAttempt,
    /// A connect attempt succeeded.
    ConnectSucceeded,
    /// A connect attempt failed.
    ConnectFailed,
    /// An open transport was lost.
    Disconnected,
    /// A pong produced an RTT sample.
    HeartbeatRtt(Duration),
    /// A heartbeat tick found the previous ping unanswered.
    HeartbeatMissed,
    /// An inbound event survived dedup.
    InboundEvent,
    /// An inbound event was dropped as a duplicate.
    DuplicateDropped,
    /// A frame failed to decode.
    ProtocolError,
    /// A frame had an unknown type.
    UnknownEvent,
    /// A message was confirmed by the server.
    MessageAcknowledged,
    /// A delivery attempt failed (will retry or fail terminally).
    DeliveryAttemptFailed,
    /// A message exhausted its retry budget.
    MessageFailed,
}

/// Cheap, cloneable handle components use to report events.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Option<Arc<Telemetry>>);

impl Recorder {
    /// Recorder feeding `telemetry`.
    pub fn new(telemetry: &Arc<Telemetry>) -> Self {
        Self(Some(Arc::clone(telemetry)))
    }

    /// Recorder that drops everything.
    pub fn disabled() -> Self {
        Self(None)
    }

    /// Report one event.
    pub fn record(&self, event: TelemetryEvent) {
        if let Some(telemetry) = &self.0 {
            telemetry.record(event);
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: u64,
    connect_successes: u64,
    connect_failures: u64,
    failure_streak: u32,
    max_failure_streak: u32,
    disconnects: u64,
    heartbeat_misses: u64,
    rtt_total: u64,
    events: u64,
    duplicates: u64,
    protocol_errors: u64,
    unknown_events: u64,
    acks: u64,
    delivery_failures: u64,
    messages_failed: u64,
}

#[derive(Debug)]
struct State {
    counters: Counters,
    rtt_samples: VecDeque<Duration>,
    event_times: VecDeque<Instant>,
    outage_started: Option<Instant>,
    last_recovery: Option<Duration>,
    window_start: Instant,
}

impl State {
    fn new(now: Instant) -> Self {
        Self {
            counters: Counters::default(),
            rtt_samples: VecDeque::with_capacity(RTT_SAMPLE_CAPACITY),
            event_times: VecDeque::new(),
            outage_started: None,
            last_recovery: None,
            window_start: now,
        }
    }
}

/// Telemetry aggregator.
#[derive(Debug)]
pub struct Telemetry {
    state: Mutex<State>,
}

/// Event rate over one sliding window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowRate {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Events in the window.
    pub count: usize,
    /// Events per second.
    pub per_sec: f64,
}

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// Score >= 90.
    Good,
    /// Score >= 65.
    Warning,
    /// Score >= 35.
    Degraded,
    /// Anything lower.
    Critical,
}

impl HealthLevel {
    fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Good
        } else if score >= 65.0 {
            Self::Warning
        } else if score >= 35.0 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}

/// Composite health indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    /// Weighted total, 0-100.
    pub score: f64,
    /// Classification of `score`.
    pub level: HealthLevel,
    /// Reconnect sub-score.
    pub reconnect: f64,
    /// Heartbeat sub-score.
    pub heartbeat: f64,
    /// Spike sub-score.
    pub spikes: f64,
    /// Recovery-time sub-score.
    pub recovery: f64,
}

/// Point-in-time view of counters and derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Connect attempts.
    pub connect_attempts: u64,
    /// Successful connects.
    pub connect_successes: u64,
    /// Failed connects.
    pub connect_failures: u64,
    /// Current consecutive connect failures.
    pub failure_streak: u32,
    /// Longest failure streak seen.
    pub max_failure_streak: u32,
    /// Lost transports.
    pub disconnects: u64,
    /// Unanswered pings.
    pub heartbeat_misses: u64,
    /// RTT samples retained.
    pub rtt_samples: usize,
    /// Median RTT in milliseconds.
    pub rtt_p50_ms: Option<f64>,
    /// 90th percentile RTT in milliseconds.
    pub rtt_p90_ms: Option<f64>,
    /// Mean absolute RTT delta in milliseconds.
    pub jitter_ms: Option<f64>,
    /// Inbound events dispatched.
    pub events: u64,
    /// Duplicates dropped.
    pub duplicates: u64,
    /// Undecodable frames.
    pub protocol_errors: u64,
    /// Frames with unknown type.
    pub unknown_events: u64,
    /// Server acknowledgements.
    pub acks: u64,
    /// Failed delivery attempts.
    pub delivery_failures: u64,
    /// Messages that exhausted retries.
    pub messages_failed: u64,
    /// Connect success ratio (1.0 when nothing was attempted).
    pub success_rate: f64,
    /// Event rates, shortest window first.
    pub rates: Vec<WindowRate>,
    /// Shortest-window rate over longest-window baseline.
    pub spike_factor: f64,
    /// Whether the spike thresholds are met.
    pub spike: bool,
    /// Duration of the last outage that ended in a successful connect.
    pub last_recovery_ms: Option<u64>,
    /// Composite health.
    pub health: HealthScore,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::new(Instant::now())),
        }
    }
}

impl Telemetry {
    /// Create a shared aggregator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an event at the current instant.
    pub fn record(&self, event: TelemetryEvent) {
        self.record_at(event, Instant::now());
    }

    /// Record an event at `now`.
    pub fn record_at(&self, event: TelemetryEvent, now: Instant) {
        let mut guard = self.state.lock().expect("telemetry lock poisoned");
        let state = &mut *guard;
        let c = &mut state.counters;
        match event {
            TelemetryEvent::ConnectAttempt => c.connect_attempts += 1,
            TelemetryEvent::ConnectSucceeded => {
                c.connect_successes += 1;
                c.failure_streak = 0;
                if let Some(started) = state.outage_started.take() {
                    state.last_recovery = Some(now.saturating_duration_since(started));
                }
            }
            TelemetryEvent::ConnectFailed => {
                c.connect_failures += 1;
                c.failure_streak += 1;
                c.max_failure_streak = c.max_failure_streak.max(c.failure_streak);
                state.outage_started.get_or_insert(now);
            }
            TelemetryEvent::Disconnected => {
                c.disconnects += 1;
                state.outage_started.get_or_insert(now);
            }
            TelemetryEvent::HeartbeatRtt(rtt) => {
                c.rtt_total += 1;
                if state.rtt_samples.len() >= RTT_SAMPLE_CAPACITY {
                    state.rtt_samples.pop_front();
                }
                state.rtt_samples.push_back(rtt);
            }
            TelemetryEvent::HeartbeatMissed => c.heartbeat_misses += 1,
            TelemetryEvent::InboundEvent => {
                c.events += 1;
                if state.event_times.len() >= EVENT_TIME_CAPACITY {
                    state.event_times.pop_front();
                }
                state.event_times.push_back(now);
            }
            TelemetryEvent::DuplicateDropped => c.duplicates += 1,
            TelemetryEvent::ProtocolError => c.protocol_errors += 1,
            TelemetryEvent::UnknownEvent => c.unknown_events += 1,
            TelemetryEvent::MessageAcknowledged => c.acks += 1,
            TelemetryEvent::DeliveryAttemptFailed => c.delivery_failures += 1,
            TelemetryEvent::MessageFailed => c.messages_failed += 1,
        }
    }

    /// Snapshot at the current instant, optionally resetting afterwards.
    pub fn snapshot(&self, reset: bool) -> TelemetrySnapshot {
        self.snapshot_at(Instant::now(), reset)
    }

    /// Snapshot at `now`, optionally resetting afterwards.
    pub fn snapshot_at(&self, now: Instant, reset: bool) -> TelemetrySnapshot {
        let mut guard = self.state.lock().expect("telemetry lock poisoned");
        let state = &mut *guard;

        let longest = RATE_WINDOWS[RATE_WINDOWS.len() - 1];
        while state
            .event_times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > longest)
        {
            state.event_times.pop_front();
        }

        let elapsed = now.saturating_duration_since(state.window_start);
        let rates: Vec<WindowRate> = RATE_WINDOWS
            .iter()
            .map(|window| window_rate(&state.event_times, now, *window, elapsed))
            .collect();
        let short = rates.first().map_or(0.0, |r| r.per_sec);
        let baseline = rates.last().map_or(0.0, |r| r.per_sec);
        let floor = 1.0 / longest.as_secs_f64();
        let spike_factor = if short == 0.0 {
            0.0
        } else {
            short / baseline.max(floor)
        };
        let spike = spike_factor >= SPIKE_FACTOR_MIN && short >= SPIKE_RATE_MIN;

        let c = &state.counters;
        let success_rate = if c.connect_attempts == 0 {
            1.0
        } else {
            c.connect_successes as f64 / c.connect_attempts as f64
        };

        let mut sorted: Vec<f64> = state.rtt_samples.iter().map(duration_ms).collect();
        sorted.sort_by(f64::total_cmp);
        let rtt_p50_ms = percentile(&sorted, 0.5);
        let rtt_p90_ms = percentile(&sorted, 0.9);
        let jitter_ms = jitter(&state.rtt_samples);

        let health = health_score(
            success_rate,
            c.failure_streak,
            c.heartbeat_misses,
            c.rtt_total,
            rtt_p90_ms,
            spike_factor,
            spike,
            state.last_recovery,
        );

        let snapshot = TelemetrySnapshot {
            connect_attempts: c.connect_attempts,
            connect_successes: c.connect_successes,
            connect_failures: c.connect_failures,
            failure_streak: c.failure_streak,
            max_failure_streak: c.max_failure_streak,
            disconnects: c.disconnects,
            heartbeat_misses: c.heartbeat_misses,
            rtt_samples: state.rtt_samples.len(),
            rtt_p50_ms,
            rtt_p90_ms,
            jitter_ms,
            events: c.events,
            duplicates: c.duplicates,
            protocol_errors: c.protocol_errors,
            unknown_events: c.unknown_events,
            acks: c.acks,
            delivery_failures: c.delivery_failures,
            messages_failed: c.messages_failed,
            success_rate,
            rates,
            spike_factor,
            spike,
            last_recovery_ms: state.last_recovery.map(|d| d.as_millis() as u64),
            health,
        };

        if reset {
            *state = State::new(now);
        }
        snapshot
    }
}

fn duration_ms(d: &Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn window_rate(
    times: &VecDeque<Instant>,
    now: Instant,
    window: Duration,
    elapsed: Duration,
) -> WindowRate {
    let count = times
        .iter()
        .rev()
        .take_while(|t| now.saturating_duration_since(**t) <= window)
        .count();
    // Early on, divide by the time actually observed so baselines are not diluted.
    let effective = window.min(elapsed).max(Duration::from_secs(1));
    WindowRate {
        window_secs: window.as_secs(),
        count,
        per_sec: count as f64 / effective.as_secs_f64(),
    }
}

fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted.get(rank).copied()
}

fn jitter(samples: &VecDeque<Duration>) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = samples
        .iter()
        .zip(samples.iter().skip(1))
        .map(|(a, b)| (duration_ms(a) - duration_ms(b)).abs())
        .collect();
    Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
}

#[expect(
    clippy::too_many_arguments,
    reason = "pure scoring function over independent counters"
)]
fn health_score(
    success_rate: f64,
    failure_streak: u32,
    heartbeat_misses: u64,
    rtt_total: u64,
    rtt_p90_ms: Option<f64>,
    spike_factor: f64,
    spike: bool,
    last_recovery: Option<Duration>,
) -> HealthScore {
    let reconnect =
        (success_rate - 0.6 * (f64::from(failure_streak) / STREAK_NORMALIZER)).clamp(0.0, 1.0)
            * 100.0;

    let probes = heartbeat_misses + rtt_total;
    let miss_ratio = if probes == 0 {
        0.0
    } else {
        heartbeat_misses as f64 / probes as f64
    };
    let latency_penalty = rtt_p90_ms.map_or(0.0, |p90| ((p90 - 500.0) / 50.0).clamp(0.0, 30.0));
    let heartbeat = ((1.0 - miss_ratio) * 100.0 - latency_penalty).clamp(0.0, 100.0);

    let spikes = if spike {
        (100.0 - (spike_factor - 1.0) * 20.0).clamp(0.0, 100.0)
    } else {
        100.0
    };

    let recovery = last_recovery.map_or(100.0, |d| {
        let secs = d.as_secs_f64();
        if secs <= 5.0 {
            100.0
        } else {
            (100.0 * (1.0 - (secs - 5.0) / 55.0)).clamp(0.0, 100.0)
        }
    });

    let (w_reconnect, w_heartbeat, w_spikes, w_recovery) = HEALTH_WEIGHTS;
    let score = reconnect * w_reconnect
        + heartbeat * w_heartbeat
        + spikes * w_spikes
        + recovery * w_recovery;

    HealthScore {
        score,
        level: HealthLevel::from_score(score),
        reconnect,
        heartbeat,
        spikes,
        recovery,
    }
}
