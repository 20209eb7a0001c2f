//! Identifiers for sessions and connections.
//!
//! A [`SessionId`] is a client-provided, opaque string that names a logical
//! chat channel. Because it is taken verbatim from a URL path segment, it is
//! sanitized on construction to a safe alphabet before it is ever used as a
//! fan-out group key or presence-index key. A [`ConnectionId`] is always
//! server-generated and never derived from client input.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length (in bytes) a sanitized [`SessionId`] may have.
pub const SESSION_ID_MAX_LEN: usize = 80;

/// The identifier of a logical chat session.
///
/// Constructed via [`SessionId::sanitize`], which replaces any byte outside
/// `[A-Za-z0-9_.-]` with `_` and truncates the result to
/// [`SESSION_ID_MAX_LEN`] bytes. Two session ids that sanitize to the same
/// string are treated as the same session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// The identifier of a single live WebSocket connection.
///
/// Always server-assigned (a v4 UUID rendered without hyphens, matching the
/// terse `connection_id` shape clients see on the wire) and unique for the
/// lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl SessionId {
    /// Sanitizes a raw, client-provided session-id string.
    ///
    /// Any byte not in `[A-Za-z0-9_.-]` becomes `_`; the result is truncated
    /// to [`SESSION_ID_MAX_LEN`] bytes. Never fails: an empty input sanitizes
    /// to an empty `SessionId`.
    pub fn sanitize(raw: &str) -> Self {
        let sanitized: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .take(SESSION_ID_MAX_LEN)
            .collect();
        Self(sanitized)
    }

    /// Returns the sanitized string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ConnectionId {
    /// Generates a new, random `ConnectionId`.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::sanitize(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::sanitize(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_foreign_characters() {
        let id = SessionId::sanitize("abc/../123 ok?");
        assert_eq!(id.as_str(), "abc___123_ok_");
    }

    #[test]
    fn truncates_to_max_len() {
        let raw = "a".repeat(200);
        let id = SessionId::sanitize(&raw);
        assert_eq!(id.as_str().len(), SESSION_ID_MAX_LEN);
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
