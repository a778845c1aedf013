//! Opaque identifiers for sessions and conversation nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a session id. Session ids become git ref path
/// components, so they are kept short and restricted to a safe alphabet.
pub const MAX_SESSION_ID_LEN: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid session id {0:?}: use 1-100 ASCII letters, digits, '-' or '_'")]
pub struct InvalidSessionId(pub String);

/// Identifier of a conversation session.
///
/// Validated on construction and on deserialization, because it is embedded
/// in the snapshot ref namespace (`refs/cairn/<session>/...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidSessionId> {
        let id = id.into();
        if is_valid_session_id(&id) {
            Ok(Self(id))
        } else {
            Err(InvalidSessionId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_session_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a node in the external conversation tree. Opaque to Cairn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::new("0192f1c2-7a3b-7d41-9c1e-2b8f0a6d4e51").is_ok());
        assert!(SessionId::new("session_1").is_ok());
        assert!(SessionId::new("").is_err());
        assert!(SessionId::new("../escape").is_err());
        assert!(SessionId::new("has space").is_err());
        assert!(SessionId::new("a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_session_id_deserialize_rejects_ref_unsafe() {
        let ok: SessionId = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(ok.as_str(), "abc-123");
        assert!(serde_json::from_str::<SessionId>("\"refs/heads\"").is_err());
    }
}
