//! Connection lifecycle state machine.
//!
//! ```text
//!            connect            opened
//!   Idle ───────────► Connecting ──────► Open ◄──────────┐
//!                       ▲   │              │ 2 missed     │ pong
//!            retry due  │   │ failed       ▼              │
//!                       │   │           Degraded ─────────┘
//!                 Reconnecting ◄───────────┘ lost / 4 missed
//!                       │
//!                       └─ retries exhausted / close ──► Closed (terminal)
//! ```
//!
//! Transitions are validated here and applied under a single lock by the
//! connection manager, so no two transitions interleave.

use std::fmt;

use serde::Serialize;

/// Why the connection reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called; auto-reconnect is suppressed.
    Manual,
    /// The reconnect budget ran out.
    RetriesExhausted,
}

/// Connection state as observed from outside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, `connect()` not called yet.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Transport open and heartbeats answered.
    Open,
    /// Transport open but heartbeats are going unanswered.
    Degraded {
        /// Consecutive unanswered pings.
        missed_heartbeats: u32,
    },
    /// Waiting before the next connect attempt.
    Reconnecting {
        /// Failed attempts since the last successful open.
        attempt: u32,
        /// Delay before the next attempt, in milliseconds.
        next_retry_ms: u64,
    },
    /// Terminal.
    Closed(CloseReason),
}

impl ConnectionState {
    /// True while frames can be written to the transport.
    pub fn is_transmitting(&self) -> bool {
        matches!(self, Self::Open | Self::Degraded { .. })
    }

    /// True once the terminal state has been reached.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Degraded { .. } => "degraded",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Closed(_) => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degraded { missed_heartbeats } => {
                write!(f, "degraded ({missed_heartbeats} missed)")
            }
            Self::Reconnecting {
                attempt,
                next_retry_ms,
            } => write!(f, "reconnecting (attempt {attempt}, in {next_retry_ms}ms)"),
            Self::Closed(reason) => write!(f, "closed ({reason:?})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Start a connect attempt (first connect or retry due).
    Connect,
    /// Handshake succeeded.
    Opened,
    /// Heartbeat miss threshold reached.
    HeartbeatMissed {
        /// Consecutive misses so far.
        missed: u32,
    },
    /// A pong arrived.
    HeartbeatRecovered,
    /// Connect failed or the open transport was lost; a retry is scheduled.
    LinkLost {
        /// Failed attempts since the last open.
        attempt: u32,
        /// Scheduled delay in milliseconds.
        delay_ms: u64,
    },
    /// Retry budget exhausted.
    GiveUp,
    /// Explicit `close()`.
    Close,
}

/// Rejected transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State at the time of the event.
    pub from: ConnectionState,
    /// Rejected event.
    pub event: LifecycleEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {:?} from {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// Validating wrapper around [`ConnectionState`].
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Start in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply `event`, returning the new state.
    ///
    /// `Close` on an already closed machine is accepted and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for edges the lifecycle does not have;
    /// every event except `Close` is rejected once `Closed`.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState as S;
        use LifecycleEvent as E;

        let next = match (self.state, event) {
            (S::Closed(reason), E::Close) => S::Closed(reason),
            (_, E::Close) => S::Closed(CloseReason::Manual),
            (S::Idle | S::Reconnecting { .. }, E::Connect) => S::Connecting,
            (S::Connecting, E::Opened) => S::Open,
            (S::Open | S::Degraded { .. }, E::HeartbeatMissed { missed }) => S::Degraded {
                missed_heartbeats: missed,
            },
            (S::Open | S::Degraded { .. }, E::HeartbeatRecovered) => S::Open,
            (S::Connecting | S::Open | S::Degraded { .. }, E::LinkLost { attempt, delay_ms }) => {
                S::Reconnecting {
                    attempt,
                    next_retry_ms: delay_ms,
                }
            }
            (
                S::Connecting | S::Open | S::Degraded { .. } | S::Reconnecting { .. },
                E::GiveUp,
            ) => S::Closed(CloseReason::RetriesExhausted),
            (from, event) => return Err(InvalidTransition { from, event }),
        };
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(events: &[LifecycleEvent]) -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::new();
        for event in events {
            machine.apply(*event).unwrap();
        }
        machine
    }

    #[test]
    fn test_happy_path() {
        let machine = machine_in(&[LifecycleEvent::Connect, LifecycleEvent::Opened]);
        assert_eq!(machine.state(), ConnectionState::Open);
        assert!(machine.state().is_transmitting());
    }

    #[test]
    fn test_degraded_and_recovery() {
        let mut machine = machine_in(&[LifecycleEvent::Connect, LifecycleEvent::Opened]);
        let state = machine
            .apply(LifecycleEvent::HeartbeatMissed { missed: 2 })
            .unwrap();
        assert_eq!(
            state,
            ConnectionState::Degraded {
                missed_heartbeats: 2
            }
        );
        assert!(state.is_transmitting());
        assert_eq!(
            machine.apply(LifecycleEvent::HeartbeatRecovered).unwrap(),
            ConnectionState::Open
        );
    }

    #[test]
    fn test_reconnect_cycle() {
        let mut machine = machine_in(&[LifecycleEvent::Connect]);
        machine
            .apply(LifecycleEvent::LinkLost {
                attempt: 1,
                delay_ms: 3000,
            })
            .unwrap();
        assert!(!machine.state().is_transmitting());
        assert_eq!(
            machine.apply(LifecycleEvent::Connect).unwrap(),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_connect_is_rejected_while_open() {
        let mut machine = machine_in(&[LifecycleEvent::Connect, LifecycleEvent::Opened]);
        let err = machine.apply(LifecycleEvent::Connect).unwrap_err();
        assert_eq!(err.from, ConnectionState::Open);
        assert_eq!(machine.state(), ConnectionState::Open);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut machine = machine_in(&[LifecycleEvent::Connect, LifecycleEvent::GiveUp]);
        assert_eq!(
            machine.state(),
            ConnectionState::Closed(CloseReason::RetriesExhausted)
        );
        assert!(machine.apply(LifecycleEvent::Connect).is_err());
        assert!(machine.apply(LifecycleEvent::Opened).is_err());
        // Close keeps the original reason.
        assert_eq!(
            machine.apply(LifecycleEvent::Close).unwrap(),
            ConnectionState::Closed(CloseReason::RetriesExhausted)
        );
    }

    #[test]
    fn test_close_from_any_live_state_is_manual() {
        for events in [
            vec![],
            vec![LifecycleEvent::Connect],
            vec![LifecycleEvent::Connect, LifecycleEvent::Opened],
        ] {
            let mut machine = machine_in(&events);
            assert_eq!(
                machine.apply(LifecycleEvent::Close).unwrap(),
                ConnectionState::Closed(CloseReason::Manual)
            );
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(
            ConnectionState::Reconnecting {
                attempt: 2,
                next_retry_ms: 4500
            }
            .to_string(),
            "reconnecting (attempt 2, in 4500ms)"
        );
    }
}
