//! Repository traits describing the primary and relationship store adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{AuthorProfile, ContentItem};
use crate::domain::types::{ContentId, ContentStatus, Privacy, RelationshipStatus, UserId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("store timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Offset-based window over an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: usize,
    pub limit: usize,
}

impl PageWindow {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// Predicate for the fallback aggregation: active items authored by the
/// viewer (any privacy) or by a listed friend with a qualifying privacy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCandidateFilter {
    pub viewer: UserId,
    pub friend_ids: Vec<UserId>,
    pub friend_privacies: Vec<Privacy>,
}

impl FeedCandidateFilter {
    pub fn for_viewer(viewer: UserId, friend_ids: Vec<UserId>) -> Self {
        Self {
            viewer,
            friend_ids,
            friend_privacies: Privacy::ALL
                .into_iter()
                .filter(|privacy| privacy.is_friend_visible())
                .collect(),
        }
    }

    pub fn admits(&self, item: &ContentItem) -> bool {
        if !item.is_active() {
            return false;
        }
        if item.author_id == self.viewer {
            return true;
        }
        self.friend_ids.contains(&item.author_id) && self.friend_privacies.contains(&item.privacy)
    }
}

#[derive(Debug, Clone)]
pub struct NewContent {
    pub id: ContentId,
    pub author_id: UserId,
    pub privacy: Privacy,
    pub body: String,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait ContentRepo: Send + Sync {
    async fn find_by_id(&self, id: ContentId) -> Result<Option<ContentItem>, RepoError>;

    /// Candidates admitted by `filter`, newest first, sliced by `window`.
    async fn query_feed_candidates(
        &self,
        filter: &FeedCandidateFilter,
        window: PageWindow,
    ) -> Result<Vec<ContentItem>, RepoError>;
}

#[async_trait]
pub trait ContentWriteRepo: Send + Sync {
    async fn insert_content(&self, params: NewContent) -> Result<ContentItem, RepoError>;

    async fn set_status(
        &self,
        id: ContentId,
        status: ContentStatus,
    ) -> Result<ContentItem, RepoError>;
}

#[async_trait]
pub trait RelationshipRepo: Send + Sync {
    async fn friend_ids(&self, user: UserId) -> Result<Vec<UserId>, RepoError>;

    /// `accepted` writes both directions; `removed` and `blocked` delete both.
    /// Idempotent.
    async fn upsert_or_remove_edge(
        &self,
        user_a: UserId,
        user_b: UserId,
        status: RelationshipStatus,
    ) -> Result<(), RepoError>;

    async fn sync_user_node(&self, user: UserId) -> Result<(), RepoError>;
}

#[async_trait]
pub trait ProfileRepo: Send + Sync {
    async fn upsert_profile(&self, profile: &AuthorProfile) -> Result<(), RepoError>;

    async fn find_profile(&self, user: UserId) -> Result<Option<AuthorProfile>, RepoError>;
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn item(author: UserId, privacy: Privacy, status: ContentStatus) -> ContentItem {
        ContentItem {
            id: ContentId::new(),
            author_id: author,
            privacy,
            status,
            body: String::new(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            author: None,
        }
    }

    #[test]
    fn filter_admits_own_content_at_any_privacy() {
        let viewer = UserId(Uuid::from_u128(1));
        let filter = FeedCandidateFilter::for_viewer(viewer, Vec::new());

        assert!(filter.admits(&item(viewer, Privacy::SelfOnly, ContentStatus::Active)));
        assert!(!filter.admits(&item(viewer, Privacy::Public, ContentStatus::Archived)));
    }

    #[test]
    fn filter_requires_friendship_and_qualifying_privacy() {
        let viewer = UserId(Uuid::from_u128(1));
        let friend = UserId(Uuid::from_u128(2));
        let stranger = UserId(Uuid::from_u128(3));
        let filter = FeedCandidateFilter::for_viewer(viewer, vec![friend]);

        assert!(filter.admits(&item(friend, Privacy::Public, ContentStatus::Active)));
        assert!(filter.admits(&item(friend, Privacy::FriendsOnly, ContentStatus::Active)));
        assert!(!filter.admits(&item(friend, Privacy::SelfOnly, ContentStatus::Active)));
        assert!(!filter.admits(&item(stranger, Privacy::Public, ContentStatus::Active)));
    }
}
