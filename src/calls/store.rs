//! Session state store.
//!
//! Holds at most one call session and one escrow negotiation for the local
//! party. The only way to change either is through [`SessionStore::apply_call`],
//! [`SessionStore::apply_escrow`] or [`SessionStore::reset`], which run the
//! state machines and translate their effects into outbound events and
//! notifications.

use chrono::Utc;
use serde::Serialize;

use super::error::CallError;
use super::escrow::{
    self, EscrowDisposition, EscrowEffect, EscrowIgnoreReason, EscrowNegotiation, EscrowState,
    EscrowTransition,
};
use super::payload::SignalEvent;
use super::state::{
    self, CallEffect, CallSession, CallState, CallTransition, Disposition, EndReason, IgnoreReason,
};
use crate::types::call::{Origin, Party, RoomId};
use crate::types::events::{CallStateChanged, EscrowStateChanged, SessionEnded, UiCue};

/// Something the presentation layer should hear about.
#[derive(Debug, Clone)]
pub enum Notification {
    CallState(CallStateChanged),
    SessionEnded(SessionEnded),
    EscrowState(EscrowStateChanged),
    Cue(UiCue),
}

/// Why an event left the store untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    Call(IgnoreReason),
    Escrow(EscrowIgnoreReason),
}

/// Result of one store mutation.
#[derive(Debug, Clone, Default)]
pub struct StoreUpdate {
    /// Events to publish, in order.
    pub outbound: Vec<SignalEvent>,
    pub notifications: Vec<Notification>,
    pub ignored: Option<Ignored>,
}

impl StoreUpdate {
    fn ignored(reason: Ignored) -> Self {
        Self {
            ignored: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored.is_some()
    }
}

/// Serializable view of the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub local: Party,
    pub call_state: CallState,
    pub session: Option<CallSession>,
    pub escrow_state: EscrowState,
    pub escrow: Option<EscrowNegotiation>,
}

#[derive(Debug)]
pub struct SessionStore {
    local: Party,
    session: Option<CallSession>,
    escrow: Option<EscrowNegotiation>,
}

impl SessionStore {
    pub fn new(local: Party) -> Self {
        Self {
            local,
            session: None,
            escrow: None,
        }
    }

    pub fn local(&self) -> &Party {
        &self.local
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn escrow(&self) -> Option<&EscrowNegotiation> {
        self.escrow.as_ref()
    }

    pub fn call_state(&self) -> CallState {
        self.session.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn escrow_state(&self) -> EscrowState {
        self.escrow.as_ref().map(|n| n.state).unwrap_or_default()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.session.as_ref().map(|s| &s.room_id)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            local: self.local.clone(),
            call_state: self.call_state(),
            session: self.session.clone(),
            escrow_state: self.escrow_state(),
            escrow: self.escrow.clone(),
        }
    }

    /// Run the call state machine.
    pub fn apply_call(&mut self, trigger: CallTransition) -> Result<StoreUpdate, CallError> {
        let room_id = trigger.room_id().clone();
        let outcome = match state::transition(self.session.as_ref(), trigger)? {
            Disposition::Applied(outcome) => outcome,
            Disposition::Ignored(reason) => return Ok(StoreUpdate::ignored(Ignored::Call(reason))),
        };

        let mut update = StoreUpdate::default();
        let now = Utc::now();
        let cue_room = outcome
            .next
            .as_ref()
            .map(|s| s.room_id.clone())
            .or_else(|| outcome.ended.as_ref().map(|s| s.room_id.clone()))
            .unwrap_or(room_id);

        let mut end_reason = None;
        for effect in outcome.effects {
            match effect {
                CallEffect::Emit(event) => update.outbound.push(event),
                CallEffect::ShowIncomingPrompt => {
                    if let Some(s) = &outcome.next {
                        update.notifications.push(Notification::Cue(UiCue::ShowIncomingPrompt {
                            room_id: s.room_id.clone(),
                            caller: s.caller.clone(),
                        }));
                    }
                }
                CallEffect::DismissPrompt => {
                    update.notifications.push(Notification::Cue(UiCue::DismissIncomingPrompt {
                        room_id: cue_room.clone(),
                    }))
                }
                CallEffect::DismissOutgoing => {
                    update.notifications.push(Notification::Cue(UiCue::DismissOutgoing {
                        room_id: cue_room.clone(),
                    }))
                }
                CallEffect::EnterSession => {
                    if let Some(s) = &outcome.next {
                        update.notifications.push(Notification::Cue(UiCue::EnterSession {
                            room_id: s.room_id.clone(),
                            peer: s.peer().clone(),
                        }));
                    }
                }
                CallEffect::ShowRejectedNotice => {
                    if let Some(s) = &outcome.ended {
                        update.notifications.push(Notification::Cue(UiCue::CallRejected {
                            room_id: s.room_id.clone(),
                            by: s.peer().clone(),
                        }));
                    }
                }
                CallEffect::TearDown(reason) => end_reason = Some(reason),
            }
        }

        let previous = outcome.previous;
        let current = outcome.next.as_ref().map(|s| s.state).unwrap_or_default();
        self.session = outcome.next;

        if let (Some(ended), Some(reason)) = (outcome.ended, end_reason) {
            self.finish_session(ended, previous, reason, &mut update);
        } else if previous != current {
            update.notifications.push(Notification::CallState(CallStateChanged {
                room_id: cue_room,
                previous,
                current,
                session: self.session.clone(),
                at: now,
            }));
        }

        Ok(update)
    }

    /// Run the escrow state machine against the current session.
    pub fn apply_escrow(&mut self, trigger: EscrowTransition) -> Result<StoreUpdate, CallError> {
        let outcome =
            match escrow::transition(self.session.as_ref(), self.escrow.as_ref(), trigger)? {
                EscrowDisposition::Applied(outcome) => outcome,
                EscrowDisposition::Ignored(reason) => {
                    return Ok(StoreUpdate::ignored(Ignored::Escrow(reason)));
                }
            };

        let mut update = StoreUpdate::default();
        let subject = outcome.next.clone().or_else(|| self.escrow.clone());
        let Some(room_id) = subject
            .as_ref()
            .map(|n| n.room_id.clone())
            .or_else(|| self.room_id().cloned())
        else {
            return Ok(update);
        };
        let reference = subject.as_ref().map(|n| n.reference.clone()).unwrap_or_default();

        for effect in outcome.effects.iter() {
            match effect {
                EscrowEffect::Emit(event) => update.outbound.push(event.clone()),
                EscrowEffect::ShowPaymentPrompt => {
                    if let Some(n) = &outcome.next {
                        update.notifications.push(Notification::Cue(UiCue::ShowPaymentPrompt {
                            room_id: room_id.clone(),
                            reference: n.reference.clone(),
                            amount: n.amount,
                            item_title: n.item_title.clone(),
                        }));
                    }
                }
                EscrowEffect::DismissPaymentPrompt => {
                    update.notifications.push(Notification::Cue(UiCue::DismissPaymentPrompt {
                        room_id: room_id.clone(),
                    }))
                }
                EscrowEffect::ShowOutcome(state) => {
                    update.notifications.push(Notification::Cue(UiCue::ShowPaymentOutcome {
                        room_id: room_id.clone(),
                        reference: reference.clone(),
                        state: *state,
                    }))
                }
            }
        }

        let previous = outcome.previous;
        let current = outcome.next_state();
        // A replaced negotiation (simultaneous requests) keeps the same state
        // but changes identity, so compare the whole record.
        let changed = previous != current || self.escrow != outcome.next;
        self.escrow = outcome.next;

        if changed {
            update.notifications.push(Notification::EscrowState(EscrowStateChanged {
                room_id,
                previous,
                current,
                negotiation: self.escrow.clone(),
                at: Utc::now(),
            }));
        }

        Ok(update)
    }

    /// Discard all state without emitting anything. Used on transport loss,
    /// de-authentication and explicit local reset.
    pub fn reset(&mut self, reason: EndReason) -> StoreUpdate {
        let mut update = StoreUpdate::default();
        if let Some(mut ended) = self.session.take() {
            let previous = ended.state;
            ended.state = CallState::Ended;
            self.finish_session(ended, previous, reason, &mut update);
        }
        update
    }

    /// Record the end of a session: drop any negotiation, then report the
    /// final snapshot and the return to Idle.
    fn finish_session(
        &mut self,
        ended: CallSession,
        previous: CallState,
        reason: EndReason,
        update: &mut StoreUpdate,
    ) {
        if let Some(negotiation) = self.escrow.take() {
            if negotiation.state == EscrowState::Requested
                && negotiation.requested_by == Origin::Remote
            {
                update.notifications.push(Notification::Cue(UiCue::DismissPaymentPrompt {
                    room_id: negotiation.room_id.clone(),
                }));
            }
            update.notifications.push(Notification::EscrowState(EscrowStateChanged {
                room_id: negotiation.room_id.clone(),
                previous: negotiation.state,
                current: EscrowState::None,
                negotiation: None,
                at: Utc::now(),
            }));
        }

        let now = Utc::now();
        update.notifications.push(Notification::Cue(UiCue::LeaveSession {
            room_id: ended.room_id.clone(),
            reason,
        }));
        update.notifications.push(Notification::CallState(CallStateChanged {
            room_id: ended.room_id.clone(),
            previous,
            current: CallState::Ended,
            session: Some(ended.clone()),
            at: now,
        }));
        update.notifications.push(Notification::CallState(CallStateChanged {
            room_id: ended.room_id.clone(),
            previous: CallState::Ended,
            current: CallState::Idle,
            session: None,
            at: now,
        }));
        update.notifications.push(Notification::SessionEnded(SessionEnded {
            session: ended,
            reason,
            at: now,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::payload::{CallData, EscrowDetails};
    use crate::calls::signaling::SignalKind;

    fn alice() -> Party {
        Party::new("alice", "Alice")
    }

    fn bob() -> Party {
        Party::new("bob", "Bob")
    }

    fn room() -> RoomId {
        RoomId::from("room-1")
    }

    fn active_store() -> SessionStore {
        let mut store = SessionStore::new(alice());
        store
            .apply_call(CallTransition::Initiate {
                data: CallData::new(room(), alice(), bob()),
            })
            .unwrap();
        store
            .apply_call(CallTransition::RemoteAccepted { room_id: room() })
            .unwrap();
        assert_eq!(store.call_state(), CallState::Active);
        store
    }

    fn shoes() -> EscrowDetails {
        EscrowDetails {
            amount: 5000.0,
            item_title: "Shoes".to_string(),
            item_description: "Size 42".to_string(),
            reference: None,
            call_session_id: None,
        }
    }

    fn call_transitions(update: &StoreUpdate) -> Vec<(CallState, CallState)> {
        update
            .notifications
            .iter()
            .filter_map(|n| match n {
                Notification::CallState(c) => Some((c.previous, c.current)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_initiate_emits_and_notifies() {
        let mut store = SessionStore::new(alice());
        let update = store
            .apply_call(CallTransition::Initiate {
                data: CallData::new(room(), alice(), bob()),
            })
            .unwrap();

        assert_eq!(update.outbound.len(), 1);
        assert_eq!(update.outbound[0].kind, SignalKind::Outgoing);
        assert_eq!(
            call_transitions(&update),
            vec![(CallState::Idle, CallState::Outgoing)]
        );
        assert_eq!(store.room_id(), Some(&room()));
    }

    #[test]
    fn test_duplicate_accept_changes_nothing() {
        let mut store = active_store();
        let before = store.snapshot();
        let update = store
            .apply_call(CallTransition::RemoteAccepted { room_id: room() })
            .unwrap();
        assert!(update.is_ignored());
        assert!(update.notifications.is_empty());
        assert!(update.outbound.is_empty());
        assert_eq!(store.session(), before.session.as_ref());
    }

    #[test]
    fn test_end_discards_negotiation() {
        let mut store = active_store();
        store
            .apply_escrow(EscrowTransition::Request { details: shoes() })
            .unwrap();
        assert_eq!(store.escrow_state(), EscrowState::Requested);

        let update = store
            .apply_call(CallTransition::RemoteEnded { room_id: room() })
            .unwrap();
        assert_eq!(store.call_state(), CallState::Idle);
        assert!(store.escrow().is_none());
        assert_eq!(
            call_transitions(&update),
            vec![
                (CallState::Active, CallState::Ended),
                (CallState::Ended, CallState::Idle)
            ]
        );
        assert!(update.notifications.iter().any(|n| matches!(
            n,
            Notification::EscrowState(e) if e.current == EscrowState::None
        )));
        assert!(update.notifications.iter().any(|n| matches!(
            n,
            Notification::SessionEnded(e) if e.reason == EndReason::RemoteHangup
        )));
    }

    #[test]
    fn test_escrow_gated_after_session_ends() {
        let mut store = active_store();
        store
            .apply_call(CallTransition::End { room_id: room() })
            .unwrap();
        let err = store
            .apply_escrow(EscrowTransition::Request { details: shoes() })
            .unwrap_err();
        assert!(matches!(err, CallError::EscrowUnavailable));
        assert_eq!(store.escrow_state(), EscrowState::None);
    }

    #[test]
    fn test_reset_is_silent_and_idle() {
        let mut store = active_store();
        let update = store.reset(EndReason::Disconnected);
        assert!(update.outbound.is_empty());
        assert_eq!(store.call_state(), CallState::Idle);
        assert!(update.notifications.iter().any(|n| matches!(
            n,
            Notification::SessionEnded(e) if e.reason == EndReason::Disconnected
        )));

        // Nothing left to reset.
        assert!(store.reset(EndReason::Disconnected).notifications.is_empty());
    }

    #[test]
    fn test_escrow_outcome_then_acknowledge() {
        let mut store = active_store();
        let update = store
            .apply_escrow(EscrowTransition::Request { details: shoes() })
            .unwrap();
        let reference = update.outbound[0]
            .escrow_details()
            .unwrap()
            .reference
            .unwrap();

        let update = store
            .apply_escrow(EscrowTransition::RemoteResponded {
                room_id: room(),
                accepted: false,
                reference: Some(reference.clone()),
            })
            .unwrap();
        assert_eq!(store.escrow_state(), EscrowState::Rejected);
        assert!(update.notifications.iter().any(|n| matches!(
            n,
            Notification::Cue(UiCue::ShowPaymentOutcome { state: EscrowState::Rejected, reference: r, .. }) if r == &reference
        )));

        store.apply_escrow(EscrowTransition::Acknowledge).unwrap();
        assert_eq!(store.escrow_state(), EscrowState::None);
        assert_eq!(store.call_state(), CallState::Active);
    }

    fn bob_active_store() -> SessionStore {
        let mut store = SessionStore::new(bob());
        store
            .apply_call(CallTransition::RemoteIncoming {
                data: CallData::new(room(), alice(), bob()),
            })
            .unwrap();
        store
            .apply_call(CallTransition::Accept { room_id: room() })
            .unwrap();
        store
    }

    fn remote_request(reference: &str) -> EscrowTransition {
        EscrowTransition::RemoteRequested {
            room_id: room(),
            details: EscrowDetails {
                reference: Some(reference.to_string()),
                ..shoes()
            },
        }
    }

    #[test]
    fn test_request_after_peer_acknowledged_reaches_responder() {
        let mut requester = active_store();
        let mut responder = bob_active_store();

        let update = requester
            .apply_escrow(EscrowTransition::Request { details: shoes() })
            .unwrap();
        let first = update.outbound[0].escrow_details().unwrap().reference.unwrap();
        responder.apply_escrow(remote_request(&first)).unwrap();
        responder
            .apply_escrow(EscrowTransition::Respond { accept: false })
            .unwrap();
        requester
            .apply_escrow(EscrowTransition::RemoteResponded {
                room_id: room(),
                accepted: false,
                reference: Some(first.clone()),
            })
            .unwrap();

        // The requester clears the outcome and asks again before the
        // responder has cleared its own.
        requester.apply_escrow(EscrowTransition::Acknowledge).unwrap();
        let update = requester
            .apply_escrow(EscrowTransition::Request { details: shoes() })
            .unwrap();
        let second = update.outbound[0].escrow_details().unwrap().reference.unwrap();
        assert_ne!(first, second);
        assert_eq!(responder.escrow_state(), EscrowState::Rejected);

        let update = responder.apply_escrow(remote_request(&second)).unwrap();
        assert!(!update.is_ignored());
        assert!(update.notifications.iter().any(|n| matches!(
            n,
            Notification::Cue(UiCue::ShowPaymentPrompt { reference, .. }) if reference == &second
        )));
        assert_eq!(responder.escrow_state(), EscrowState::Requested);

        // Both sides can finish the new negotiation.
        let update = responder
            .apply_escrow(EscrowTransition::Respond { accept: true })
            .unwrap();
        assert_eq!(update.outbound[0].kind, SignalKind::EscrowAccepted);
        requester
            .apply_escrow(EscrowTransition::RemoteResponded {
                room_id: room(),
                accepted: true,
                reference: Some(second),
            })
            .unwrap();
        assert_eq!(requester.escrow_state(), EscrowState::Accepted);
        assert_eq!(responder.escrow_state(), EscrowState::Accepted);
    }

    #[test]
    fn test_acknowledge_without_negotiation_notifies_nothing() {
        let mut store = active_store();
        let update = store.apply_escrow(EscrowTransition::Acknowledge).unwrap();
        assert!(update.is_ignored());
        assert!(update.notifications.is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let store = active_store();
        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json["callState"], "Active");
        assert_eq!(json["escrowState"], "None");
        assert_eq!(json["session"]["roomId"], "room-1");
    }
}
