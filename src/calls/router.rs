//! Event router.
//!
//! The single path between the signaling channel and the state machines.
//! Inbound messages are validated, then offered to the call machine first;
//! escrow events only reach the escrow machine when the call for their room
//! is active. Local actions run their optimistic transition immediately and
//! then publish whatever the machine emitted.

use super::error::CallError;
use super::escrow::{EscrowIgnoreReason, EscrowTransition};
use super::payload::{InboundSignal, SignalEvent};
use super::signaling::SignalKind;
use super::state::{CallTransition, IgnoreReason};
use super::store::{Ignored, SessionStore, StoreUpdate};
use crate::channel::{ChannelError, ChannelEvent, SignalingChannel};
use crate::types::events::SignalDropped;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What happened to an inbound message.
#[derive(Debug)]
pub enum Routed {
    /// Reached a state machine and changed something.
    Applied(StoreUpdate),
    /// Discarded without touching state.
    Dropped(SignalDropped),
}

pub struct EventRouter {
    channel: Arc<dyn SignalingChannel>,
}

impl EventRouter {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }

    /// Subscribe `handler` to every kind a peer can send us.
    ///
    /// All topics feed the same queue so inbound events are processed one at
    /// a time, in arrival order.
    pub async fn subscribe(&self, handler: &mpsc::Sender<ChannelEvent>) -> Result<(), ChannelError> {
        for kind in SignalKind::ALL {
            if kind == SignalKind::Outgoing {
                continue;
            }
            self.channel.subscribe(kind.topic(), handler.clone()).await?;
        }
        Ok(())
    }

    /// Validate and dispatch one inbound message.
    pub async fn handle_inbound(&self, store: &mut SessionStore, raw: &InboundSignal) -> Routed {
        let event = match SignalEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Dropping malformed {} signal for room '{}': {}",
                    raw.topic, raw.room_id, e
                );
                return Routed::Dropped(dropped(raw, e.to_string()));
            }
        };

        debug!(
            "Received {} for room {} from {}",
            event.kind, event.room_id, event.payload.caller.id
        );

        let result = if let Some(trigger) = CallTransition::from_remote(&event) {
            store.apply_call(trigger)
        } else if event.kind.is_escrow() {
            // The call machine gates escrow: no active call for this room, no escrow.
            let gated = store
                .session()
                .is_some_and(|s| s.state.is_active() && s.room_id == event.room_id);
            if !gated {
                let reason = EscrowIgnoreReason::NoActiveSession {
                    room_id: event.room_id.clone(),
                };
                log_ignored(&event, &Ignored::Escrow(reason.clone()));
                return Routed::Dropped(dropped(raw, format!("{:?}", reason)));
            }
            match EscrowTransition::from_remote(&event) {
                Some(trigger) => store.apply_escrow(trigger),
                None => {
                    warn!("Dropping {} for room {}: unreadable escrow data", event.kind, event.room_id);
                    return Routed::Dropped(dropped(raw, "unreadable escrow data".to_string()));
                }
            }
        } else {
            debug!("Dropping {} for room {}: not an inbound kind", event.kind, event.room_id);
            return Routed::Dropped(dropped(raw, "not an inbound kind".to_string()));
        };

        match result {
            Ok(update) => {
                if let Some(reason) = &update.ignored {
                    log_ignored(&event, reason);
                    return Routed::Dropped(dropped(raw, format!("{:?}", reason)));
                }
                self.publish(&update.outbound).await;
                Routed::Applied(update)
            }
            // Remote triggers never fail in the machines; treat it as a drop anyway.
            Err(e) => {
                warn!("Failed to apply {} for room {}: {}", event.kind, event.room_id, e);
                Routed::Dropped(dropped(raw, e.to_string()))
            }
        }
    }

    /// Apply a local call action, then publish what it emitted.
    pub async fn local_call(
        &self,
        store: &mut SessionStore,
        trigger: CallTransition,
    ) -> Result<StoreUpdate, CallError> {
        let update = store.apply_call(trigger)?;
        self.publish(&update.outbound).await;
        Ok(update)
    }

    /// Apply a local escrow action, then publish what it emitted.
    pub async fn local_escrow(
        &self,
        store: &mut SessionStore,
        trigger: EscrowTransition,
    ) -> Result<StoreUpdate, CallError> {
        let update = store.apply_escrow(trigger)?;
        self.publish(&update.outbound).await;
        Ok(update)
    }

    /// Publish events in order. Failures are logged and not retried.
    /// Returns how many publishes the channel accepted.
    pub async fn publish(&self, events: &[SignalEvent]) -> usize {
        let mut sent = 0;
        for event in events {
            match self
                .channel
                .publish(event.kind.topic(), event.room_id.as_str(), event.to_wire())
                .await
            {
                Ok(()) => {
                    debug!("Published {} for room {}", event.kind, event.room_id);
                    sent += 1;
                }
                Err(e) => warn!(
                    "Failed to publish {} for room {}: {}",
                    event.kind, event.room_id, e
                ),
            }
        }
        sent
    }
}

fn dropped(raw: &InboundSignal, reason: String) -> SignalDropped {
    SignalDropped {
        topic: raw.topic.clone(),
        room_id: raw.room_id.clone(),
        reason,
    }
}

fn log_ignored(event: &SignalEvent, reason: &Ignored) {
    match reason {
        Ignored::Call(IgnoreReason::Stale { expected, got }) => debug!(
            "Ignoring stale {} for room {} (current: {:?})",
            event.kind, got, expected
        ),
        Ignored::Call(IgnoreReason::Duplicate { room_id, state }) => debug!(
            "Ignoring duplicate {} for room {} in state {:?}",
            event.kind, room_id, state
        ),
        Ignored::Call(IgnoreReason::OutOfPlace { room_id, state }) => info!(
            "Ignoring {} for room {} in state {:?}",
            event.kind, room_id, state
        ),
        Ignored::Escrow(EscrowIgnoreReason::NoActiveSession { room_id }) => warn!(
            "Protocol violation: {} for room {} without an active call",
            event.kind, room_id
        ),
        Ignored::Escrow(other) => debug!(
            "Ignoring {} for room {}: {:?}",
            event.kind, event.room_id, other
        ),
    }
}
