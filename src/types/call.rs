use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a call participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub id: String,
    pub display_name: String,
}

impl Party {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// Correlation key shared by every event of one call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Generate a fresh room id for a call placed by `initiator`.
    ///
    /// Format: `<initiator id>-<unix millis>-<8 hex chars>`. The random suffix
    /// keeps two attempts within the same millisecond apart.
    pub fn generate(initiator: &Party) -> Self {
        let suffix: [u8; 4] = rand::random();
        Self(format!(
            "{}-{}-{}",
            initiator.id,
            Utc::now().timestamp_millis(),
            hex::encode(suffix)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side of the exchange originated something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}
