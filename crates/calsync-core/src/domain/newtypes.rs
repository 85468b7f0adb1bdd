//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers and opaque provider values.
//! Each newtype ensures data validity at construction time, so the rest of
//! the crate never handles an empty calendar id or a blank sync token.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

/// Implements the string plumbing shared by validated string newtypes:
/// `as_str`, `Display`, `FromStr`, `TryFrom<String>` and `From<T> for String`.
macro_rules! string_newtype {
    ($name:ident) => {
        impl $name {
            /// Get the inner string reference
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s.to_string())
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

// ============================================================================
// Configuration identifiers
// ============================================================================

fn validate_slug(kind: &str, id: &str) -> Result<(), DomainError> {
    if id.is_empty() {
        return Err(DomainError::InvalidId(format!("{kind} ID cannot be empty")));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(DomainError::InvalidId(format!(
            "{kind} ID contains invalid characters: {id}"
        )));
    }
    Ok(())
}

/// Identifier of a configured sync source (e.g. "work-google")
///
/// Restricted to ASCII alphanumerics, `-`, `_` and `.` because it is embedded
/// in dedup keys and relay cursors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Create a new SourceId
    ///
    /// # Errors
    /// Returns error if the id is empty or contains characters outside
    /// `[A-Za-z0-9._-]`
    pub fn new(id: String) -> Result<Self, DomainError> {
        validate_slug("Source", &id)?;
        Ok(Self(id))
    }
}

string_newtype!(SourceId);

/// Identifier of the sync destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DestinationId(String);

impl DestinationId {
    /// Create a new DestinationId
    ///
    /// # Errors
    /// Returns error under the same rules as [`SourceId::new`]
    pub fn new(id: String) -> Result<Self, DomainError> {
        validate_slug("Destination", &id)?;
        Ok(Self(id))
    }
}

string_newtype!(DestinationId);

/// Identifier of a registered remote agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Create a new random AgentId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an AgentId from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AgentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid AgentId: {e}")))
    }
}

// ============================================================================
// Provider-issued values
// ============================================================================

/// Calendar identifier as issued by a provider
///
/// Opaque apart from being non-empty and free of control characters; Google
/// ids look like e-mail addresses, Graph ids are long base64 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalendarId(String);

impl CalendarId {
    /// Create a new CalendarId
    ///
    /// # Errors
    /// Returns error if the id is blank or contains control characters
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.trim().is_empty() {
            return Err(DomainError::InvalidCalendarId(
                "Calendar ID cannot be empty".to_string(),
            ));
        }
        if id.chars().any(char::is_control) {
            return Err(DomainError::InvalidCalendarId(format!(
                "Calendar ID contains control characters: {id:?}"
            )));
        }
        Ok(Self(id))
    }
}

string_newtype!(CalendarId);

/// Opaque incremental-fetch cursor issued by a provider or by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncToken(String);

impl SyncToken {
    /// Create a new SyncToken
    ///
    /// # Errors
    /// Returns error if the token is empty
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidSyncToken(
                "Sync token cannot be empty".to_string(),
            ));
        }
        Ok(Self(token))
    }
}

string_newtype!(SyncToken);

/// Identifier of an event written to the destination calendar
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DestEventId(String);

impl DestEventId {
    /// Create a new DestEventId
    ///
    /// # Errors
    /// Returns error if the id is empty
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidEventId(
                "Destination event ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }
}

string_newtype!(DestEventId);
