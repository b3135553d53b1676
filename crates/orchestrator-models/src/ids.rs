//! Strongly typed identifiers.
//!
//! Every identifier is a thin wrapper around a `String` so it serializes as a
//! plain JSON string and can be typed on the command line.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of hex characters kept from a UUID for short ids.
const SHORT_ID_LEN: usize = 8;

fn short_uuid() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SHORT_ID_LEN);
    id
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "-{}"), short_uuid()))
            }

            /// Wraps an existing id string.
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a supervised worker, e.g. `executor-1a2b3c4d`.
    WorkerId,
    "worker"
);

string_id!(
    /// Identifier of a message.
    MessageId,
    "msg"
);

string_id!(
    /// Identifier of a scheduled check-in.
    CheckInId,
    "chk"
);

string_id!(
    /// Identifier of a gap event.
    GapId,
    "gap"
);

impl WorkerId {
    /// Generates a worker id prefixed with the worker's role name.
    pub fn for_role(role: &str) -> Self {
        Self(format!("{}-{}", role, short_uuid()))
    }
}
