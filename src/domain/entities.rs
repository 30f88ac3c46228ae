//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::types::{ContentId, ContentStatus, Privacy, UserId};

/// Author metadata joined onto content by the primary store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSummary {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Canonical content item. Snapshots cache a serialized copy of this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ContentId,
    pub author_id: UserId,
    pub privacy: Privacy,
    pub status: ContentStatus,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub author: Option<AuthorSummary>,
}

impl ContentItem {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Replica of a user's profile maintained by the profile-sync path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AuthorProfile {
    pub fn summary(&self) -> AuthorSummary {
        AuthorSummary {
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}
