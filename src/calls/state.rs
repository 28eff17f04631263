//! Call state machine implementation.
//!
//! [`transition`] is a pure function from the current session (or `None` when
//! idle) and a trigger to the next session plus the side effects the caller
//! must carry out. Remote triggers never fail: anything that does not apply
//! to the current session is reported as [`Disposition::Ignored`]. Local
//! triggers that are not valid in the current state return
//! [`InvalidTransition`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::payload::{CallData, SignalEvent};
use super::signaling::SignalKind;
use crate::types::call::{Origin, Party, RoomId};

/// Current state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    /// No session.
    #[default]
    Idle,
    /// We placed a call and are waiting for the receiver.
    Outgoing,
    /// A call is ringing locally.
    Incoming,
    /// Both parties agreed; the live session is open.
    Active,
    /// The attempt is over. Only observed on the final snapshot of a session;
    /// the store resets to `Idle` right after.
    Ended,
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming)
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local party hung up an active call.
    LocalHangup,
    /// Remote party hung up, or cancelled before we answered.
    RemoteHangup,
    /// Local party cancelled an outgoing call before it was answered.
    Cancelled,
    /// Local party declined the incoming call.
    Declined,
    /// Remote party declined our call.
    RemoteDeclined,
    /// Nobody answered within the ring timeout.
    Unanswered,
    /// The signaling channel dropped.
    Disconnected,
    /// Explicit local reset.
    Reset,
}

/// Triggers for the call state machine.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local: place a call described by `data`.
    Initiate { data: CallData },
    /// Local: answer the ringing call.
    Accept { room_id: RoomId },
    /// Local: decline the ringing call.
    Reject { room_id: RoomId },
    /// Local: hang up, or cancel before the call is active.
    End { room_id: RoomId },
    /// Local: the ring timer for `room_id` fired.
    RingTimeout { room_id: RoomId },
    /// Remote: a call is offered to us.
    RemoteIncoming { data: CallData },
    /// Remote: our call was answered.
    RemoteAccepted { room_id: RoomId },
    /// Remote: our call was declined.
    RemoteRejected { room_id: RoomId },
    /// Remote: the peer hung up or cancelled.
    RemoteEnded { room_id: RoomId },
}

impl CallTransition {
    /// Build the remote trigger for a validated inbound call event.
    ///
    /// Returns `None` for escrow kinds and for `Outgoing`, which is only ever
    /// sent, never received.
    pub fn from_remote(event: &SignalEvent) -> Option<Self> {
        let room_id = event.room_id.clone();
        match event.kind {
            SignalKind::Incoming => Some(Self::RemoteIncoming {
                data: event.payload.clone(),
            }),
            SignalKind::Accepted => Some(Self::RemoteAccepted { room_id }),
            SignalKind::Rejected => Some(Self::RemoteRejected { room_id }),
            SignalKind::Ended => Some(Self::RemoteEnded { room_id }),
            SignalKind::Outgoing
            | SignalKind::EscrowRequested
            | SignalKind::EscrowAccepted
            | SignalKind::EscrowRejected => None,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Initiate { data } | Self::RemoteIncoming { data } => &data.room_id,
            Self::Accept { room_id }
            | Self::Reject { room_id }
            | Self::End { room_id }
            | Self::RingTimeout { room_id }
            | Self::RemoteAccepted { room_id }
            | Self::RemoteRejected { room_id }
            | Self::RemoteEnded { room_id } => room_id,
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEffect {
    /// Publish this event on the signaling channel.
    Emit(SignalEvent),
    /// Show the incoming call prompt.
    ShowIncomingPrompt,
    /// Hide the incoming call prompt.
    DismissPrompt,
    /// Hide the outgoing "calling..." UI.
    DismissOutgoing,
    /// Open the live session.
    EnterSession,
    /// Tell the caller the call was declined.
    ShowRejectedNotice,
    /// Close the live session and discard call state.
    TearDown(EndReason),
}

/// A call session as tracked by one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub room_id: RoomId,
    pub caller: Party,
    pub receiver: Party,
    pub state: CallState,
    pub attached_data: Option<Value>,
    /// `Local` when we placed the call.
    pub direction: Origin,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new_outgoing(data: CallData) -> Self {
        Self::from_data(data, Origin::Local, CallState::Outgoing)
    }

    pub fn new_incoming(data: CallData) -> Self {
        Self::from_data(data, Origin::Remote, CallState::Incoming)
    }

    fn from_data(data: CallData, direction: Origin, state: CallState) -> Self {
        Self {
            room_id: data.room_id,
            caller: data.caller,
            receiver: data.receiver,
            state,
            attached_data: data.data,
            direction,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.direction == Origin::Local
    }

    /// The other participant.
    pub fn peer(&self) -> &Party {
        match self.direction {
            Origin::Local => &self.receiver,
            Origin::Remote => &self.caller,
        }
    }

    /// Payload echoed on every event of this attempt.
    pub fn call_data(&self) -> CallData {
        CallData {
            room_id: self.room_id.clone(),
            caller: self.caller.clone(),
            receiver: self.receiver.clone(),
            data: self.attached_data.clone(),
        }
    }

    fn event(&self, kind: SignalKind) -> CallEffect {
        CallEffect::Emit(SignalEvent::new(kind, self.call_data()))
    }

    fn with_state(&self, state: CallState) -> Self {
        let mut next = self.clone();
        next.state = state;
        if state == CallState::Active && next.connected_at.is_none() {
            next.connected_at = Some(Utc::now());
        }
        next
    }
}

/// Why a trigger left the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The event belongs to another (or no) call attempt.
    Stale {
        expected: Option<RoomId>,
        got: RoomId,
    },
    /// Already applied; replays are no-ops.
    Duplicate { room_id: RoomId, state: CallState },
    /// Right room, but the event has no meaning in the current state.
    OutOfPlace { room_id: RoomId, state: CallState },
}

/// Result of applying a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub previous: CallState,
    /// The session after the transition. `None` means Idle.
    pub next: Option<CallSession>,
    /// Final snapshot (state `Ended`) when the transition tore the session down.
    pub ended: Option<CallSession>,
    pub effects: Vec<CallEffect>,
}

impl CallOutcome {
    pub fn next_state(&self) -> CallState {
        self.next.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn emitted(&self) -> impl Iterator<Item = &SignalEvent> {
        self.effects.iter().filter_map(|e| match e {
            CallEffect::Emit(event) => Some(event),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Applied(CallOutcome),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

fn invalid(current: Option<&CallSession>, attempted: &str) -> InvalidTransition {
    InvalidTransition {
        current_state: match current {
            Some(s) => format!("{:?}({})", s.state, s.room_id),
            None => format!("{:?}", CallState::Idle),
        },
        attempted: attempted.to_string(),
    }
}

fn applied(
    current: Option<&CallSession>,
    next: Option<CallSession>,
    effects: Vec<CallEffect>,
) -> Disposition {
    Disposition::Applied(CallOutcome {
        previous: current.map(|s| s.state).unwrap_or_default(),
        next,
        ended: None,
        effects,
    })
}

fn torn_down(current: &CallSession, mut effects: Vec<CallEffect>, reason: EndReason) -> Disposition {
    effects.push(CallEffect::TearDown(reason));
    Disposition::Applied(CallOutcome {
        previous: current.state,
        next: None,
        ended: Some(current.with_state(CallState::Ended)),
        effects,
    })
}

/// Compute the next call state for `trigger`.
pub fn transition(
    current: Option<&CallSession>,
    trigger: CallTransition,
) -> Result<Disposition, InvalidTransition> {
    use CallState::*;

    let room_id = trigger.room_id().clone();

    // Remote events for another attempt never touch local state.
    let matches_room = current.is_some_and(|s| s.room_id == room_id);
    let stale = || {
        Disposition::Ignored(IgnoreReason::Stale {
            expected: current.map(|s| s.room_id.clone()),
            got: room_id.clone(),
        })
    };

    let disposition = match trigger {
        CallTransition::Initiate { data } => match current {
            None => {
                let session = CallSession::new_outgoing(data);
                let effects = vec![session.event(SignalKind::Outgoing)];
                applied(current, Some(session), effects)
            }
            Some(_) => return Err(invalid(current, "Initiate")),
        },

        CallTransition::RemoteIncoming { data } => match current {
            None => {
                let session = CallSession::new_incoming(data);
                applied(current, Some(session), vec![CallEffect::ShowIncomingPrompt])
            }
            Some(s) if s.room_id == data.room_id => {
                Disposition::Ignored(if s.state == Incoming {
                    IgnoreReason::Duplicate {
                        room_id: data.room_id,
                        state: s.state,
                    }
                } else {
                    IgnoreReason::OutOfPlace {
                        room_id: data.room_id,
                        state: s.state,
                    }
                })
            }
            // Busy: decline the new attempt, keep ours.
            Some(s) => {
                let busy = CallEffect::Emit(SignalEvent::new(SignalKind::Rejected, data));
                applied(current, Some(s.clone()), vec![busy])
            }
        },

        CallTransition::Accept { .. } => match current {
            Some(s) if matches_room && s.state == Incoming => {
                let next = s.with_state(Active);
                let effects = vec![
                    next.event(SignalKind::Accepted),
                    CallEffect::DismissPrompt,
                    CallEffect::EnterSession,
                ];
                applied(current, Some(next), effects)
            }
            Some(s) if matches_room && s.state == Active && !s.is_initiator() => {
                Disposition::Ignored(IgnoreReason::Duplicate {
                    room_id: room_id.clone(),
                    state: s.state,
                })
            }
            _ => return Err(invalid(current, "Accept")),
        },

        CallTransition::Reject { .. } => match current {
            Some(s) if matches_room && s.state == Incoming => torn_down(
                s,
                vec![s.event(SignalKind::Rejected), CallEffect::DismissPrompt],
                EndReason::Declined,
            ),
            _ => return Err(invalid(current, "Reject")),
        },

        CallTransition::End { .. } => match current {
            Some(s) if matches_room => match s.state {
                Outgoing => torn_down(
                    s,
                    vec![s.event(SignalKind::Ended), CallEffect::DismissOutgoing],
                    EndReason::Cancelled,
                ),
                Incoming => torn_down(
                    s,
                    vec![s.event(SignalKind::Rejected), CallEffect::DismissPrompt],
                    EndReason::Declined,
                ),
                Active => torn_down(s, vec![s.event(SignalKind::Ended)], EndReason::LocalHangup),
                Idle | Ended => return Err(invalid(current, "End")),
            },
            _ => return Err(invalid(current, "End")),
        },

        CallTransition::RingTimeout { .. } => match current {
            Some(s) if matches_room && s.state == Outgoing => torn_down(
                s,
                vec![s.event(SignalKind::Ended), CallEffect::DismissOutgoing],
                EndReason::Unanswered,
            ),
            Some(s) if matches_room && s.state == Incoming => torn_down(
                s,
                vec![s.event(SignalKind::Rejected), CallEffect::DismissPrompt],
                EndReason::Unanswered,
            ),
            // The call moved on before the timer fired.
            _ => stale(),
        },

        CallTransition::RemoteAccepted { .. } => match current {
            Some(s) if matches_room => match s.state {
                Outgoing => {
                    let next = s.with_state(Active);
                    let effects = vec![CallEffect::DismissOutgoing, CallEffect::EnterSession];
                    applied(current, Some(next), effects)
                }
                Active => Disposition::Ignored(IgnoreReason::Duplicate {
                    room_id: room_id.clone(),
                    state: s.state,
                }),
                _ => Disposition::Ignored(IgnoreReason::OutOfPlace {
                    room_id: room_id.clone(),
                    state: s.state,
                }),
            },
            _ => stale(),
        },

        CallTransition::RemoteRejected { .. } => match current {
            Some(s) if matches_room && s.state == Outgoing => torn_down(
                s,
                vec![CallEffect::DismissOutgoing, CallEffect::ShowRejectedNotice],
                EndReason::RemoteDeclined,
            ),
            // First writer wins: an accept already applied stands.
            Some(s) if matches_room => Disposition::Ignored(IgnoreReason::OutOfPlace {
                room_id: room_id.clone(),
                state: s.state,
            }),
            _ => stale(),
        },

        CallTransition::RemoteEnded { .. } => match current {
            Some(s) if matches_room => {
                let effects = match s.state {
                    Outgoing => vec![CallEffect::DismissOutgoing],
                    Incoming => vec![CallEffect::DismissPrompt],
                    _ => Vec::new(),
                };
                torn_down(s, effects, EndReason::RemoteHangup)
            }
            _ => stale(),
        },
    };

    Ok(disposition)
}
