//! Signal kind definitions.
//!
//! These are the `kind` values carried on the wire. Each kind is also the
//! topic name a client subscribes to on the signaling channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling message kinds for call and escrow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// A call is being offered to the receiving party.
    Incoming,

    /// The caller placed a call. The relay forwards it to the receiver as
    /// [`SignalKind::Incoming`].
    Outgoing,

    /// The receiver answered.
    Accepted,

    /// The receiver declined, or was busy.
    Rejected,

    /// Either party hung up or cancelled.
    Ended,

    /// Payment request inside an active call.
    EscrowRequested,

    /// Payment request approved by the paying party.
    EscrowAccepted,

    /// Payment request declined by the paying party.
    EscrowRejected,
}

impl SignalKind {
    /// All signal kinds in order.
    pub const ALL: [SignalKind; 8] = [
        Self::Incoming,
        Self::Outgoing,
        Self::Accepted,
        Self::Rejected,
        Self::Ended,
        Self::EscrowRequested,
        Self::EscrowAccepted,
        Self::EscrowRejected,
    ];

    /// Topic name used on the channel.
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Incoming => "Incoming",
            Self::Outgoing => "Outgoing",
            Self::Accepted => "Accepted",
            Self::Rejected => "Rejected",
            Self::Ended => "Ended",
            Self::EscrowRequested => "EscrowRequested",
            Self::EscrowAccepted => "EscrowAccepted",
            Self::EscrowRejected => "EscrowRejected",
        }
    }

    /// Parse a topic name. Unknown names yield `None`.
    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.topic() == topic)
    }

    /// Whether this kind belongs to the escrow sub-protocol.
    pub const fn is_escrow(&self) -> bool {
        matches!(
            self,
            Self::EscrowRequested | Self::EscrowAccepted | Self::EscrowRejected
        )
    }

    /// Whether this kind closes a call attempt.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Ended)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_round_trip() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_topic(kind.topic()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_topic() {
        assert_eq!(SignalKind::from_topic("Ringing"), None);
        assert_eq!(SignalKind::from_topic("incoming"), None);
        assert_eq!(SignalKind::from_topic(""), None);
    }

    #[test]
    fn test_escrow_kinds() {
        let escrow: Vec<_> = SignalKind::ALL.iter().filter(|k| k.is_escrow()).collect();
        assert_eq!(escrow.len(), 3);
        assert!(!SignalKind::Accepted.is_escrow());
    }
}
