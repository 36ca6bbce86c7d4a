//! Call session state machine.
//!
//! Pure transition logic: `apply` takes an event, moves the state and returns
//! the effects the owning actor must run. It performs no I/O, so every
//! transition can be tested without a runtime.
//!
//! Events not valid in the current state return `None` and change nothing.
//!
//! # Ring timer
//!
//! Arming the ring timer hands out a fresh generation. Cancelling it bumps
//! the generation, so a timer that was already due when it was cancelled
//! carries a stale generation and is ignored.

use super::messages::EndReason;
use crate::peer::Role;
use common::CallStatus;
use serde::Serialize;
use std::fmt;

/// Local state of one participant's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initiating,
    Ringing,
    Accepted,
    Connected,
    Declined,
    Ended,
    TimedOut,
}

impl CallState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallState::Initiating => "initiating",
            CallState::Ringing => "ringing",
            CallState::Accepted => "accepted",
            CallState::Connected => "connected",
            CallState::Declined => "declined",
            CallState::Ended => "ended",
            CallState::TimedOut => "timed_out",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Declined | CallState::Ended | CallState::TimedOut
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local media acquired, adapter created and record written.
    PeerReady,
    /// The adapter reported an established connection.
    PeerConnected,
    /// The ring timer fired.
    RingTimeout { generation: u64 },
    /// The record's status changed (possibly by this participant).
    RemoteStatus(CallStatus),
    /// Local hang-up.
    HangUp,
    /// Local decline of an incoming call that was never answered.
    Decline,
    /// The adapter reported an error.
    PeerFailed,
    /// The adapter reported the connection closed.
    PeerClosed,
    /// A signaling write failed.
    TransportFailed,
    /// The service is shutting down.
    Shutdown,
    /// Resources have been released.
    CleanupComplete,
}

/// Side effects requested by a transition, run in order by the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ArmRingTimer { generation: u64 },
    CancelRingTimer,
    /// Write the status field. Failure ends the session.
    PublishStatus(CallStatus),
    /// Write `status=ended` and `endedAt`. Best-effort: failure is logged only.
    PublishEnded,
    /// Release subscriptions, the adapter and local media.
    Cleanup(EndReason),
}

/// Result of applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
    pub effects: Vec<Effect>,
}

/// The session state machine.
#[derive(Debug, Clone)]
pub struct CallStateMachine {
    role: Role,
    state: CallState,
    timer_generation: u64,
    timer_armed: bool,
    end_reason: Option<EndReason>,
}

impl CallStateMachine {
    /// Machine for a session of the given role. Initiators start in
    /// `Initiating`; responders are created by answering, so they start in
    /// `Accepted`.
    #[must_use]
    pub fn new(role: Role) -> Self {
        let state = match role {
            Role::Initiator => CallState::Initiating,
            Role::Responder => CallState::Accepted,
        };
        Self {
            role,
            state,
            timer_generation: 0,
            timer_armed: false,
            end_reason: None,
        }
    }

    /// Machine for an incoming call that is still ringing and has not been
    /// answered. The only thing that can happen to it locally is a decline.
    #[must_use]
    pub fn incoming() -> Self {
        Self {
            role: Role::Responder,
            state: CallState::Ringing,
            timer_generation: 0,
            timer_armed: false,
            end_reason: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// Generation of the currently armed ring timer, if any.
    #[must_use]
    pub fn armed_timer(&self) -> Option<u64> {
        self.timer_armed.then_some(self.timer_generation)
    }

    /// Apply an event. Returns `None` (and changes nothing) if the event is
    /// not valid in the current state.
    pub fn apply(&mut self, event: SessionEvent) -> Option<Transition> {
        use CallState as S;
        use SessionEvent as E;

        let from = self.state;
        let (to, effects) = match (from, event) {
            (S::Initiating, E::PeerReady) if self.role == Role::Initiator => {
                let generation = self.arm_timer();
                (S::Ringing, vec![Effect::ArmRingTimer { generation }])
            }

            (S::Ringing | S::Accepted, E::PeerConnected) if self.is_session() => {
                let mut effects = self.cancel_timer();
                effects.push(Effect::PublishStatus(CallStatus::Connected));
                (S::Connected, effects)
            }

            (S::Ringing, E::RingTimeout { generation })
                if self.timer_armed && generation == self.timer_generation =>
            {
                self.timer_armed = false;
                self.end_reason = Some(EndReason::TimedOut);
                (
                    S::TimedOut,
                    vec![Effect::PublishEnded, Effect::Cleanup(EndReason::TimedOut)],
                )
            }

            (S::TimedOut, E::CleanupComplete) => (S::Ended, vec![]),

            (S::Ringing, E::Decline) if !self.is_session() => (
                S::Declined,
                vec![Effect::PublishStatus(CallStatus::Declined)],
            ),

            (state, E::RemoteStatus(status)) if !state.is_terminal() && self.is_session() => {
                let reason = match status {
                    CallStatus::Ended => EndReason::RemoteEnded,
                    CallStatus::Declined => EndReason::RemoteDeclined,
                    CallStatus::Ringing | CallStatus::Accepted | CallStatus::Connected => {
                        return None;
                    }
                };
                // The other side already wrote the terminal status
                self.end(reason, false)
            }

            (state, event) if !state.is_terminal() && self.is_session() => {
                let reason = match event {
                    E::HangUp => EndReason::LocalHangUp,
                    E::PeerFailed => EndReason::NegotiationFailed,
                    E::PeerClosed => EndReason::PeerClosed,
                    E::TransportFailed => EndReason::TransportFailed,
                    E::Shutdown => EndReason::Shutdown,
                    _ => return None,
                };
                self.end(reason, true)
            }

            _ => return None,
        };

        self.state = to;
        Some(Transition { from, to, effects })
    }

    /// Whether this machine drives a live session (as opposed to an
    /// unanswered incoming call).
    fn is_session(&self) -> bool {
        !(self.role == Role::Responder && self.state == CallState::Ringing)
    }

    fn arm_timer(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_armed = true;
        self.timer_generation
    }

    fn cancel_timer(&mut self) -> Vec<Effect> {
        if !self.timer_armed {
            return vec![];
        }
        self.timer_armed = false;
        self.timer_generation += 1;
        vec![Effect::CancelRingTimer]
    }

    fn end(&mut self, reason: EndReason, publish: bool) -> (CallState, Vec<Effect>) {
        let mut effects = self.cancel_timer();
        if publish {
            effects.push(Effect::PublishEnded);
        }
        effects.push(Effect::Cleanup(reason));
        self.end_reason = Some(reason);
        (CallState::Ended, effects)
    }
}
