//! Shared domain identifiers and enumerations aligned with persisted database enums.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a user (author, viewer, or timeline owner).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a content item owned by the primary store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ContentId(pub Uuid);

impl ContentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ContentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ContentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "content_privacy", rename_all = "snake_case")]
pub enum Privacy {
    Public,
    FriendsOnly,
    SelfOnly,
}

impl Privacy {
    pub const ALL: [Privacy; 3] = [Privacy::Public, Privacy::FriendsOnly, Privacy::SelfOnly];

    /// Whether friends of the author may see content with this classification.
    pub fn is_friend_visible(self) -> bool {
        matches!(self, Privacy::Public | Privacy::FriendsOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::FriendsOnly => "friends_only",
            Privacy::SelfOnly => "self_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "content_status", rename_all = "snake_case")]
pub enum ContentStatus {
    Active,
    Archived,
}

impl ContentStatus {
    pub fn is_active(self) -> bool {
        matches!(self, ContentStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Accepted,
    Removed,
    Blocked,
}

impl RelationshipStatus {
    /// `accepted` materializes a symmetric edge; `removed` and `blocked` delete it.
    pub fn creates_edge(self) -> bool {
        matches!(self, RelationshipStatus::Accepted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipStatus::Accepted => "accepted",
            RelationshipStatus::Removed => "removed",
            RelationshipStatus::Blocked => "blocked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privacy_friend_visibility() {
        assert!(Privacy::Public.is_friend_visible());
        assert!(Privacy::FriendsOnly.is_friend_visible());
        assert!(!Privacy::SelfOnly.is_friend_visible());
    }

    #[test]
    fn ids_serialize_as_bare_uuids() {
        let id = ContentId(Uuid::nil());
        let json = serde_json::to_string(&id).expect("serialize id");
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
        assert!(id.is_nil());
    }

    #[test]
    fn privacy_uses_snake_case_on_the_wire() {
        let value: Privacy = serde_json::from_str("\"friends_only\"").expect("parse privacy");
        assert_eq!(value, Privacy::FriendsOnly);
    }

    #[test]
    fn only_accepted_creates_an_edge() {
        assert!(RelationshipStatus::Accepted.creates_edge());
        assert!(!RelationshipStatus::Removed.creates_edge());
        assert!(!RelationshipStatus::Blocked.creates_edge());
    }
}
