//! The admission-granted capability tag of a connection.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The role a connection is admitted under.
///
/// Latched once on the first admission message and immutable afterwards.
/// Parsing is case-insensitive; the canonical, stored form is lower-case
/// (see [`Role::as_str`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The browser client on the other end of the conversation.
    Patient,
    /// A human agent supervising or taking over the conversation.
    Operator,
    /// The automated generation worker bridge.
    Ai,
}

/// A `user_type` value that does not parse to one of the three known roles.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid role: {0:?}")]
pub struct InvalidRole(pub String);

impl Role {
    /// Returns the canonical lower-case wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Operator => "operator",
            Role::Ai => "ai",
        }
    }
}

impl FromStr for Role {
    type Err = InvalidRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "operator" => Ok(Role::Operator),
            "ai" => Ok(Role::Ai),
            _ => Err(InvalidRole(s.to_owned())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("PATIENT".parse::<Role>().unwrap(), Role::Patient);
        assert_eq!("Operator".parse::<Role>().unwrap(), Role::Operator);
        assert_eq!("ai".parse::<Role>().unwrap(), Role::Ai);
    }

    #[test]
    fn rejects_unknown_role() {
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn stored_form_is_lower_case() {
        assert_eq!(Role::Operator.as_str(), "operator");
    }
}
