//! Call and escrow signaling.
//!
//! Two parties agree on the lifecycle of a call by exchanging events over an
//! untrusted, at-most-once channel. While the call is active either party can
//! propose an escrow payment for an item, which the other accepts or declines.
//!
//! # Architecture
//!
//! - [`SignalKind`]: the eight event kinds exchanged on the channel
//! - [`SignalEvent`] & [`CallData`]: validated event envelope and payload
//! - [`state`]: pure call state machine ([`CallState`], [`CallTransition`])
//! - [`escrow`]: pure escrow state machine, gated on the active call
//! - [`SessionStore`]: the single owner of session and negotiation state
//! - [`EventRouter`]: validates inbound events and publishes outbound ones
//! - [`CallManager`] & [`CallHandle`]: serializes every mutation on one task
//!
//! # Protocol Overview
//!
//! The caller publishes `Outgoing`; the relay delivers it to the receiver as
//! `Incoming`. The receiver answers with `Accepted` or `Rejected`. Either side
//! ends the call with `Ended`. Events carry the room id of the attempt they
//! belong to, and anything addressed to another room is ignored.

mod error;
pub mod escrow;
mod manager;
pub mod payload;
mod router;
mod signaling;
pub mod state;
mod store;

pub use error::{CallError, PayloadError};
pub use escrow::{EscrowNegotiation, EscrowState, EscrowTransition};
pub use manager::{CallHandle, CallManager};
pub use payload::{CallData, EscrowDetails, InboundSignal, SignalEvent};
pub use router::{EventRouter, Routed};
pub use signaling::SignalKind;
pub use state::{CallSession, CallState, CallTransition, EndReason, InvalidTransition};
pub use store::{Ignored, Notification, SessionStore, StoreSnapshot, StoreUpdate};
