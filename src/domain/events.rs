//! Event contracts consumed by the ingestor.
//!
//! Payloads arrive as JSON on three logical topics. Decoding failures are
//! expected on shared topics and are never treated as processing errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::DomainError;
use super::types::{ContentId, Privacy, RelationshipStatus, UserId};

/// Logical event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Content,
    Relationship,
    Profile,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Content, Topic::Relationship, Topic::Profile];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Content => "content",
            Topic::Relationship => "relationship",
            Topic::Profile => "profile",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Topic {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "content" => Ok(Topic::Content),
            "relationship" => Ok(Topic::Relationship),
            "profile" => Ok(Topic::Profile),
            _ => Err(()),
        }
    }
}

/// A new content item was persisted; triggers fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCreated {
    pub content_id: ContentId,
    pub author_id: UserId,
    pub privacy: Privacy,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ContentCreated {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.content_id.is_nil() {
            return Err(DomainError::invalid_event(
                Topic::Content.as_str(),
                "content_id must not be nil",
            ));
        }
        if self.author_id.is_nil() {
            return Err(DomainError::invalid_event(
                Topic::Content.as_str(),
                "author_id must not be nil",
            ));
        }
        Ok(())
    }
}

/// An existing item was edited or archived. Only its snapshot is affected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChanged {
    pub content_id: ContentId,
}

/// Messages carried on the content topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentEvent {
    Created(ContentCreated),
    Edited(ContentChanged),
    Archived(ContentChanged),
}

impl ContentEvent {
    pub fn content_id(&self) -> ContentId {
        match self {
            ContentEvent::Created(event) => event.content_id,
            ContentEvent::Edited(event) | ContentEvent::Archived(event) => event.content_id,
        }
    }

    /// Authors partition the content topic so one author's posts stay ordered.
    pub fn partition_key(&self) -> Option<UserId> {
        match self {
            ContentEvent::Created(event) => Some(event.author_id),
            ContentEvent::Edited(_) | ContentEvent::Archived(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipChanged {
    pub user_a: UserId,
    pub user_b: UserId,
    pub status: RelationshipStatus,
}

impl RelationshipChanged {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.user_a.is_nil() || self.user_b.is_nil() {
            return Err(DomainError::invalid_event(
                Topic::Relationship.as_str(),
                "user ids must not be nil",
            ));
        }
        if self.user_a == self.user_b {
            return Err(DomainError::invalid_event(
                Topic::Relationship.as_str(),
                "a user cannot befriend themselves",
            ));
        }
        Ok(())
    }

    /// Unordered pair, so both directions of one edge land on the same partition.
    pub fn pair(&self) -> (UserId, UserId) {
        if self.user_a <= self.user_b {
            (self.user_a, self.user_b)
        } else {
            (self.user_b, self.user_a)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdated {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// When the profile changed at its source; older updates never overwrite newer ones.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ProfileUpdated {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.user_id.is_nil() {
            return Err(DomainError::invalid_event(
                Topic::Profile.as_str(),
                "user_id must not be nil",
            ));
        }
        Ok(())
    }
}
