//! Branded ID newtypes.
//!
//! Each identifier is a newtype over `String` so a request id cannot be
//! passed where a tool call id is expected. Generated ids are UUID v7.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh id (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                let prefix: &str = $prefix;
                if prefix.is_empty() {
                    Self(new_v7())
                } else {
                    Self(format!("{prefix}_{}", Uuid::now_v7().simple()))
                }
            }

            /// Wrap an existing value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner `String`.
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
    };
}

branded_id!(
    /// Client-supplied (or generated) id of one in-flight completion request.
    RequestId,
    ""
);

branded_id!(
    /// Conversation the request belongs to.
    ConversationId,
    ""
);

branded_id!(
    /// Identifier of one tool invocation requested by the model.
    ToolCallId,
    "call"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_uuids() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn tool_call_ids_carry_prefix() {
        let id = ToolCallId::new();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 32);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ToolCallId::from("call_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"call_abc\"");
        let back: ToolCallId = serde_json::from_str("\"call_abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn time_ordered_generation() {
        let a = ConversationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ConversationId::new();
        assert!(a < b);
    }
}
