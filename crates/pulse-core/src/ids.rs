//! Branded ID newtypes for type safety.
//!
//! Every entity in the system has a distinct ID type implemented as a newtype
//! wrapper around `String`. This prevents accidentally passing a run ID where
//! a connection ID is expected.
//!
//! IDs are opaque to this subsystem: any unique string from the external
//! ID-generation service is accepted via `From`. Local generation (tests,
//! ad-hoc tooling) uses UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
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
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a user (tenant).
    UserId
}

branded_id! {
    /// Unique identifier for a conversation thread.
    ThreadId
}

branded_id! {
    /// Unique identifier for a single agent execution.
    RunId
}

branded_id! {
    /// Unique identifier for one live connection.
    ConnectionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        let a = RunId::new();
        let b = RunId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn accepts_arbitrary_strings() {
        let id = UserId::from("user-!@#$-whatever");
        assert_eq!(id.as_str(), "user-!@#$-whatever");
    }

    #[test]
    fn display_matches_inner() {
        let id = ConnectionId::from_string("conn_1".into());
        assert_eq!(id.to_string(), "conn_1");
    }

    #[test]
    fn serde_transparent() {
        let id = ThreadId::from("t1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"t1\"");
        let back: ThreadId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn into_inner_round_trip() {
        let id = UserId::from("u_9");
        let s: String = id.clone().into();
        assert_eq!(s, "u_9");
        assert_eq!(id.into_inner(), "u_9");
    }

    #[test]
    fn deref_to_str() {
        let id = RunId::from("r1");
        fn takes_str(s: &str) -> usize {
            s.len()
        }
        assert_eq!(takes_str(&id), 2);
    }
}
