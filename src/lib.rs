//! Call and escrow signaling for a local marketplace.
//!
//! A buyer and a seller negotiate a voice call and, while it is active, an
//! escrow payment for the item being discussed. Each client runs a
//! [`calls::CallManager`] over some [`channel::SignalingChannel`]; the
//! in-process [`relay`] provides one for tests and demos.

pub mod types {
    pub mod call;
    pub mod events;
}

pub mod calls;
pub mod channel;
pub mod config;
pub mod relay;

pub use calls::{CallError, CallHandle, CallManager, CallState, EscrowState};
pub use channel::{ChannelError, ChannelEvent, SignalingChannel};
pub use config::SignalerConfig;
pub use relay::{MemoryChannel, RelayConfig, SignalRelay};
pub use types::call::{Party, RoomId};
pub use types::events::{EventBus, UiCue};
