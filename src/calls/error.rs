//! Call-related error types.

use crate::channel::ChannelError;
use crate::types::call::RoomId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("already in a call (room {0})")]
    Busy(RoomId),

    #[error("invalid escrow request: {0}")]
    InvalidEscrow(&'static str),

    #[error("escrow negotiation requires an active call")]
    EscrowUnavailable,

    #[error("not connected")]
    NotConnected,

    #[error("call coordinator has shut down")]
    CoordinatorClosed,

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Reasons an inbound message fails validation. These never reach the
/// application; the router logs and drops the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("unrecognized kind: {0}")]
    UnknownKind(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("envelope room {envelope} does not match payload room {payload}")]
    RoomMismatch { envelope: String, payload: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}
