//! Reconnection state machine for the live channel.
//!
//! [`transition`] is pure: it maps the current [`LinkState`] and one
//! [`LinkEvent`] to the next state plus the side effects the runtime must
//! perform. Timing lives entirely in [`LinkAction::ScheduleReconnect`] so the
//! backoff sequence can be checked without a socket or a clock.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Exhausted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Exhausted => "exhausted",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before attempt `n` is `min(cap, base * 2^n)`; the link gives up once
/// `max_failures` consecutive attempts have already failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_failures: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(10_000),
            max_failures: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkState {
    pub phase: ConnectionState,
    /// Consecutive failed attempts since the last successful open.
    pub attempt: u32,
    pub timer_pending: bool,
    pub stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    Opened,
    /// Close or error on the channel, or a failed connect.
    Closed,
    TimerFired,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    OpenChannel,
    SendHandshake,
    FetchSnapshot,
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelTimer,
    CloseChannel,
    GiveUp { failures: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: LinkState,
    pub actions: Vec<LinkAction>,
}

impl Transition {
    fn unchanged(state: LinkState) -> Self {
        Self {
            next: state,
            actions: Vec::new(),
        }
    }

    pub fn is_noop(&self, previous: &LinkState) -> bool {
        self.actions.is_empty() && self.next == *previous
    }
}

pub fn transition(state: LinkState, event: LinkEvent, policy: &BackoffPolicy) -> Transition {
    use ConnectionState::*;

    match (state.phase, event) {
        (Disconnected, LinkEvent::ConnectRequested) if !state.timer_pending && !state.stopped => {
            Transition {
                next: LinkState {
                    phase: Connecting,
                    ..state
                },
                actions: vec![LinkAction::OpenChannel],
            }
        }
        (Connecting, LinkEvent::Opened) => Transition {
            next: LinkState {
                phase: Connected,
                attempt: 0,
                ..state
            },
            actions: vec![LinkAction::SendHandshake, LinkAction::FetchSnapshot],
        },
        (Connecting | Connected, LinkEvent::Closed) => {
            if state.attempt >= policy.max_failures {
                return Transition {
                    next: LinkState {
                        phase: Exhausted,
                        timer_pending: false,
                        ..state
                    },
                    actions: vec![
                        LinkAction::CloseChannel,
                        LinkAction::GiveUp {
                            failures: state.attempt + 1,
                        },
                    ],
                };
            }
            let delay = policy.delay_for(state.attempt);
            let attempt = state.attempt + 1;
            Transition {
                next: LinkState {
                    phase: Disconnected,
                    attempt,
                    timer_pending: true,
                    ..state
                },
                actions: vec![
                    LinkAction::CloseChannel,
                    LinkAction::ScheduleReconnect { attempt, delay },
                ],
            }
        }
        (Disconnected, LinkEvent::TimerFired) if state.timer_pending && !state.stopped => {
            Transition {
                next: LinkState {
                    phase: Connecting,
                    timer_pending: false,
                    ..state
                },
                actions: vec![LinkAction::OpenChannel],
            }
        }
        (Exhausted, _) => Transition::unchanged(state),
        (phase, LinkEvent::Shutdown) => {
            let mut actions = Vec::new();
            if state.timer_pending {
                actions.push(LinkAction::CancelTimer);
            }
            if matches!(phase, Connecting | Connected) {
                actions.push(LinkAction::CloseChannel);
            }
            Transition {
                next: LinkState {
                    phase: Disconnected,
                    timer_pending: false,
                    stopped: true,
                    ..state
                },
                actions,
            }
        }
        // A connect that completes after the link moved on is closed again.
        (_, LinkEvent::Opened) => Transition {
            next: state,
            actions: vec![LinkAction::CloseChannel],
        },
        _ => Transition::unchanged(state),
    }
}
