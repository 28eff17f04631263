//! Escrow negotiation state machine.
//!
//! Runs nested inside an active call: every trigger except
//! [`EscrowTransition::Acknowledge`] requires the parent session for the same
//! room to be `Active`. One negotiation exists at a time.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::CallError;
use super::payload::{EscrowDetails, SignalEvent};
use super::signaling::SignalKind;
use super::state::{CallSession, InvalidTransition};
use crate::types::call::{Origin, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum EscrowState {
    #[default]
    None,
    Requested,
    Accepted,
    Rejected,
}

impl EscrowState {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowNegotiation {
    pub room_id: RoomId,
    pub amount: f64,
    pub item_title: String,
    pub item_description: String,
    pub reference: String,
    pub call_session_id: Option<String>,
    pub state: EscrowState,
    /// `Local` when we asked for the payment.
    pub requested_by: Origin,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl EscrowNegotiation {
    fn new(room_id: RoomId, details: EscrowDetails, requested_by: Origin) -> Self {
        Self {
            room_id,
            amount: details.amount,
            item_title: details.item_title,
            item_description: details.item_description,
            reference: details.reference.unwrap_or_else(generate_reference),
            call_session_id: details.call_session_id,
            state: EscrowState::Requested,
            requested_by,
            requested_at: Utc::now(),
            responded_at: None,
        }
    }

    pub fn details(&self) -> EscrowDetails {
        EscrowDetails {
            amount: self.amount,
            item_title: self.item_title.clone(),
            item_description: self.item_description.clone(),
            reference: Some(self.reference.clone()),
            call_session_id: self.call_session_id.clone(),
        }
    }

    fn settled(&self, accepted: bool) -> Self {
        let mut next = self.clone();
        next.state = if accepted {
            EscrowState::Accepted
        } else {
            EscrowState::Rejected
        };
        next.responded_at = Some(Utc::now());
        next
    }

    fn event(&self, parent: &CallSession, kind: SignalKind) -> EscrowEffect {
        // Escrow details ride in the data slot of the call payload.
        let data = serde_json::to_value(self.details()).unwrap_or_default();
        EscrowEffect::Emit(SignalEvent::new(kind, parent.call_data().with_data(data)))
    }
}

fn generate_reference() -> String {
    let bytes: [u8; 6] = rand::random();
    format!("ESC-{}", hex::encode_upper(bytes))
}

#[derive(Debug, Clone)]
pub enum EscrowTransition {
    /// Local: ask the peer to pay.
    Request { details: EscrowDetails },
    /// Local: answer the peer's request.
    Respond { accept: bool },
    /// Local: the UI consumed the outcome.
    Acknowledge,
    /// Remote: the peer asks us to pay.
    RemoteRequested {
        room_id: RoomId,
        details: EscrowDetails,
    },
    /// Remote: the peer answered our request.
    RemoteResponded {
        room_id: RoomId,
        accepted: bool,
        reference: Option<String>,
    },
}

impl EscrowTransition {
    /// Build the remote trigger for a validated inbound escrow event.
    pub fn from_remote(event: &SignalEvent) -> Option<Self> {
        let room_id = event.room_id.clone();
        match event.kind {
            SignalKind::EscrowRequested => Some(Self::RemoteRequested {
                room_id,
                details: event.escrow_details().ok()?,
            }),
            SignalKind::EscrowAccepted | SignalKind::EscrowRejected => {
                Some(Self::RemoteResponded {
                    room_id,
                    accepted: event.kind == SignalKind::EscrowAccepted,
                    reference: event.escrow_details().ok().and_then(|d| d.reference),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscrowEffect {
    Emit(SignalEvent),
    /// Ask the local user to approve a payment.
    ShowPaymentPrompt,
    DismissPaymentPrompt,
    /// Show the settled outcome until acknowledged.
    ShowOutcome(EscrowState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowIgnoreReason {
    /// No active call for this room. A correct peer never sends this.
    NoActiveSession { room_id: RoomId },
    /// Reply to a negotiation we are not tracking.
    Stale {
        expected: Option<String>,
        got: Option<String>,
    },
    Duplicate { state: EscrowState },
    OutOfPlace { state: EscrowState },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscrowOutcome {
    pub previous: EscrowState,
    /// `None` means no negotiation.
    pub next: Option<EscrowNegotiation>,
    pub effects: Vec<EscrowEffect>,
}

impl EscrowOutcome {
    pub fn next_state(&self) -> EscrowState {
        self.next.as_ref().map(|n| n.state).unwrap_or_default()
    }

    pub fn emitted(&self) -> impl Iterator<Item = &SignalEvent> {
        self.effects.iter().filter_map(|e| match e {
            EscrowEffect::Emit(event) => Some(event),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscrowDisposition {
    Applied(EscrowOutcome),
    Ignored(EscrowIgnoreReason),
}

fn invalid(current: Option<&EscrowNegotiation>, attempted: &str) -> CallError {
    CallError::InvalidTransition(InvalidTransition {
        current_state: format!("{:?}", current.map(|n| n.state).unwrap_or_default()),
        attempted: attempted.to_string(),
    })
}

fn applied(
    current: Option<&EscrowNegotiation>,
    next: Option<EscrowNegotiation>,
    effects: Vec<EscrowEffect>,
) -> EscrowDisposition {
    EscrowDisposition::Applied(EscrowOutcome {
        previous: current.map(|n| n.state).unwrap_or_default(),
        next,
        effects,
    })
}

/// The parent session, if it is active for `room_id`.
fn active_parent<'a>(parent: Option<&'a CallSession>, room_id: &RoomId) -> Option<&'a CallSession> {
    parent.filter(|p| p.state.is_active() && &p.room_id == room_id)
}

/// Compute the next escrow state for `trigger`.
///
/// Local triggers fail with [`CallError`]; remote triggers that do not apply
/// are reported as [`EscrowDisposition::Ignored`].
pub fn transition(
    parent: Option<&CallSession>,
    current: Option<&EscrowNegotiation>,
    trigger: EscrowTransition,
) -> Result<EscrowDisposition, CallError> {
    let current_state = current.map(|n| n.state).unwrap_or_default();

    let disposition = match trigger {
        EscrowTransition::Request { mut details } => {
            let parent = parent
                .filter(|p| p.state.is_active())
                .ok_or(CallError::EscrowUnavailable)?;
            details.validate().map_err(CallError::InvalidEscrow)?;
            if current.is_some() {
                return Err(invalid(current, "Request"));
            }
            if details.call_session_id.is_none() {
                details.call_session_id = Some(parent.room_id.to_string());
            }
            let next = EscrowNegotiation::new(parent.room_id.clone(), details, Origin::Local);
            let effects = vec![next.event(parent, SignalKind::EscrowRequested)];
            applied(current, Some(next), effects)
        }

        EscrowTransition::Respond { accept } => {
            let parent = parent
                .filter(|p| p.state.is_active())
                .ok_or(CallError::EscrowUnavailable)?;
            let negotiation = match current {
                Some(n) if n.state == EscrowState::Requested && n.requested_by == Origin::Remote => n,
                _ => return Err(invalid(current, "Respond")),
            };
            let next = negotiation.settled(accept);
            let kind = if accept {
                SignalKind::EscrowAccepted
            } else {
                SignalKind::EscrowRejected
            };
            let effects = vec![
                next.event(parent, kind),
                EscrowEffect::DismissPaymentPrompt,
                EscrowEffect::ShowOutcome(next.state),
            ];
            applied(current, Some(next), effects)
        }

        EscrowTransition::Acknowledge => match current_state {
            EscrowState::Accepted | EscrowState::Rejected => applied(current, None, Vec::new()),
            EscrowState::None => EscrowDisposition::Ignored(EscrowIgnoreReason::Duplicate {
                state: current_state,
            }),
            EscrowState::Requested => return Err(invalid(current, "Acknowledge")),
        },

        EscrowTransition::RemoteRequested { room_id, details } => {
            if active_parent(parent, &room_id).is_none() {
                return Ok(EscrowDisposition::Ignored(
                    EscrowIgnoreReason::NoActiveSession { room_id },
                ));
            }
            let incoming = EscrowNegotiation::new(room_id, details, Origin::Remote);
            match current {
                None => applied(current, Some(incoming), vec![EscrowEffect::ShowPaymentPrompt]),
                Some(n) if n.reference == incoming.reference => {
                    EscrowDisposition::Ignored(EscrowIgnoreReason::Duplicate { state: n.state })
                }
                // Both sides asked at once. Each side keeps the request with the
                // lower reference, so both converge on the same negotiation.
                Some(n)
                    if n.state == EscrowState::Requested
                        && n.requested_by == Origin::Local
                        && incoming.reference < n.reference =>
                {
                    applied(current, Some(incoming), vec![EscrowEffect::ShowPaymentPrompt])
                }
                // The peer already cleared the previous outcome and asked again.
                Some(n) if n.state.is_settled() => {
                    applied(current, Some(incoming), vec![EscrowEffect::ShowPaymentPrompt])
                }
                Some(n) => {
                    EscrowDisposition::Ignored(EscrowIgnoreReason::OutOfPlace { state: n.state })
                }
            }
        }

        EscrowTransition::RemoteResponded {
            room_id,
            accepted,
            reference,
        } => {
            if active_parent(parent, &room_id).is_none() {
                return Ok(EscrowDisposition::Ignored(
                    EscrowIgnoreReason::NoActiveSession { room_id },
                ));
            }
            let reference_matches =
                |n: &EscrowNegotiation| reference.as_ref().is_none_or(|r| r == &n.reference);
            match current {
                Some(n) if !reference_matches(n) => {
                    EscrowDisposition::Ignored(EscrowIgnoreReason::Stale {
                        expected: Some(n.reference.clone()),
                        got: reference.clone(),
                    })
                }
                Some(n) if n.state == EscrowState::Requested && n.requested_by == Origin::Local => {
                    let next = n.settled(accepted);
                    let effects = vec![EscrowEffect::ShowOutcome(next.state)];
                    applied(current, Some(next), effects)
                }
                Some(n) if n.state.is_settled() => {
                    EscrowDisposition::Ignored(EscrowIgnoreReason::Duplicate { state: n.state })
                }
                Some(n) => {
                    EscrowDisposition::Ignored(EscrowIgnoreReason::OutOfPlace { state: n.state })
                }
                None => EscrowDisposition::Ignored(EscrowIgnoreReason::Stale {
                    expected: None,
                    got: reference.clone(),
                }),
            }
        }
    };

    Ok(disposition)
}
