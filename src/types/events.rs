use crate::calls::escrow::{EscrowNegotiation, EscrowState};
use crate::calls::state::{CallSession, CallState, EndReason};
use crate::types::call::{Party, RoomId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The call moved from one state to another.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStateChanged {
    pub room_id: RoomId,
    pub previous: CallState,
    pub current: CallState,
    pub session: Option<CallSession>,
    pub at: DateTime<Utc>,
}

/// A session was torn down. `session.state` is `Ended`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session: CallSession,
    pub reason: EndReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowStateChanged {
    pub room_id: RoomId,
    pub previous: EscrowState,
    pub current: EscrowState,
    pub negotiation: Option<EscrowNegotiation>,
    pub at: DateTime<Utc>,
}

/// Presentation cues. The presentation layer decides how to render them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cue", rename_all = "camelCase")]
pub enum UiCue {
    ShowIncomingPrompt { room_id: RoomId, caller: Party },
    DismissIncomingPrompt { room_id: RoomId },
    DismissOutgoing { room_id: RoomId },
    EnterSession { room_id: RoomId, peer: Party },
    LeaveSession { room_id: RoomId, reason: EndReason },
    CallRejected { room_id: RoomId, by: Party },
    ShowPaymentPrompt { room_id: RoomId, reference: String, amount: f64, item_title: String },
    DismissPaymentPrompt { room_id: RoomId },
    ShowPaymentOutcome { room_id: RoomId, reference: String, state: EscrowState },
}

/// An inbound message that was dropped without changing state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDropped {
    pub topic: String,
    pub room_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionChanged {
    pub connected: bool,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self::with_capacity(CHANNEL_CAPACITY)
            }

            pub fn with_capacity(capacity: usize) -> Self {
                Self {
                    $(
                        $field: broadcast::channel(capacity).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection events
    (connection, Arc<ConnectionChanged>),

    // Call events
    (call_state, Arc<CallStateChanged>),
    (session_ended, Arc<SessionEnded>),

    // Escrow events
    (escrow_state, Arc<EscrowStateChanged>),

    // Presentation cues
    (ui, Arc<UiCue>),

    // Diagnostics
    (dropped, Arc<SignalDropped>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
