//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a tracked user.
    UserId
);

string_id!(
    /// Identifier of a family group.
    GroupId
);

string_id!(
    /// Identifier of a geofence.
    GeofenceId
);

string_id!(
    /// Identifier of an activity event.
    EventId
);

impl GeofenceId {
    /// Generates a fresh time-ordered geofence identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl EventId {
    /// Generates a fresh random event identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// The sequencing domain of the ingestion core: one live session per pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// The tracked user.
    pub user_id: UserId,
    /// The group the user is tracked in.
    pub group_id: GroupId,
}

impl SessionKey {
    /// Creates a session key.
    #[must_use]
    pub const fn new(user_id: UserId, group_id: GroupId) -> Self {
        Self { user_id, group_id }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_roundtrip_strings() {
        let user = UserId::new("u-1");
        assert_eq!(user.as_str(), "u-1");
        assert_eq!(user.to_string(), "u-1");
        assert_eq!(UserId::from("u-1"), UserId::from("u-1".to_string()));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
        assert_ne!(GeofenceId::generate(), GeofenceId::generate());
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new(UserId::new("alice"), GroupId::new("fam"));
        assert_eq!(key.to_string(), "alice@fam");
    }
}
