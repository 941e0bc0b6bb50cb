//! Branded ID newtypes.
//!
//! Workspaces, UI requests, and client connections get time-ordered UUID v7
//! identifiers. Slot ids are caller-chosen strings with `"default"` as the
//! conventional first pane, so [`SlotId`] does not mint random values.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Id of the slot every workspace starts with.
pub const DEFAULT_SLOT: &str = "default";

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
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

macro_rules! random_id {
    ($name:ident) => {
        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

branded_id! {
    /// Identity of an open workspace. A fresh one is minted every time a
    /// path is opened after having been closed.
    WorkspaceId
}
random_id!(WorkspaceId);

branded_id! {
    /// Identity of an extension-UI or questionnaire request.
    RequestId
}
random_id!(RequestId);

branded_id! {
    /// Identity of a connected transport client.
    ClientId
}
random_id!(ClientId);

branded_id! {
    /// Identity of a conversation pane within a workspace.
    SlotId
}

impl SlotId {
    /// Whether this is the workspace's default slot.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_SLOT
    }

    /// Generate a prefixed slot id such as `review-0193…`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", new_v7()))
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self(DEFAULT_SLOT.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_new_is_uuid_v7() {
        let id = WorkspaceId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn slot_id_defaults_to_default_slot() {
        let id = SlotId::default();
        assert_eq!(id.as_str(), "default");
        assert!(id.is_default());
        assert!(!SlotId::from("pane-2").is_default());
    }

    #[test]
    fn generated_slot_id_keeps_prefix() {
        let id = SlotId::generate("review");
        assert!(id.starts_with("review-"));
        assert_ne!(id, SlotId::generate("review"));
    }

    #[test]
    fn display_and_deref() {
        let id = ClientId::from("client-1");
        assert_eq!(format!("{id}"), "client-1");
        let s: &str = &id;
        assert_eq!(s, "client-1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = SlotId::from("x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"x\"");
        let back: SlotId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
