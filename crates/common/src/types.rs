//! Common data types for Room Controller components.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a caller-supplied room identifier.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Reasons a room identifier is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("room id must not be empty")]
    Empty,

    #[error("room id exceeds {MAX_ROOM_ID_LEN} characters")]
    TooLong,

    #[error("room id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Unique identifier for a room.
///
/// Room ids are caller-supplied. Only ASCII alphanumerics, `-`, `_` and `.`
/// are accepted so ids are safe to log and to use as metric-free labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    ///
    /// # Errors
    ///
    /// Returns `RoomIdError` if the id is empty, too long, or contains
    /// characters outside `[A-Za-z0-9._-]`.
    pub fn parse(id: impl Into<String>) -> Result<Self, RoomIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if id.chars().count() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(RoomIdError::InvalidCharacter(c));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a peer.
///
/// A peer id equals the id of the signaling connection that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new random peer ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_accepts_well_formed_ids() {
        assert!(RoomId::parse("r1").is_ok());
        assert!(RoomId::parse("team-standup_2024.q3").is_ok());
        assert_eq!(RoomId::parse("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_room_id_rejects_empty() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
    }

    #[test]
    fn test_room_id_rejects_too_long() {
        let id = "a".repeat(MAX_ROOM_ID_LEN + 1);
        assert_eq!(RoomId::parse(id), Err(RoomIdError::TooLong));
        assert!(RoomId::parse("a".repeat(MAX_ROOM_ID_LEN)).is_ok());
    }

    #[test]
    fn test_room_id_rejects_invalid_characters() {
        assert_eq!(
            RoomId::parse("room one"),
            Err(RoomIdError::InvalidCharacter(' '))
        );
        assert_eq!(
            RoomId::parse("room/1"),
            Err(RoomIdError::InvalidCharacter('/'))
        );
    }

    #[test]
    fn test_room_id_serde_validates() {
        let ok: RoomId = serde_json::from_str("\"r1\"").unwrap();
        assert_eq!(ok.as_str(), "r1");

        let bad: Result<RoomId, _> = serde_json::from_str("\"bad id\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_peer_ids_are_unique() {
        assert_ne!(PeerId::new(), PeerId::new());
    }
}
