//! Cache key definitions.
//!
//! Timeline lists and content snapshots live in separate namespaces. Each
//! store is typed on its own key, so a snapshot key can never address a
//! timeline list (and vice versa). `render()` produces the flat string form
//! used in logs and by string-keyed backends.

use uuid::Uuid;

use crate::domain::types::{ContentId, UserId};

/// A namespaced cache key.
pub trait CacheNamespace {
    /// Namespace prefix, unique per key type.
    const PREFIX: &'static str;

    fn raw_id(&self) -> Uuid;

    fn render(&self) -> String {
        format!("{}:{}", Self::PREFIX, self.raw_id())
    }
}

/// Key of a user's bounded timeline list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineKey(UserId);

impl From<UserId> for TimelineKey {
    fn from(value: UserId) -> Self {
        Self(value)
    }
}

impl CacheNamespace for TimelineKey {
    const PREFIX: &'static str = "timeline";

    fn raw_id(&self) -> Uuid {
        self.0.0
    }
}

/// Key of a serialized content snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotKey(ContentId);

impl From<ContentId> for SnapshotKey {
    fn from(value: ContentId) -> Self {
        Self(value)
    }
}

impl CacheNamespace for SnapshotKey {
    const PREFIX: &'static str = "snapshot";

    fn raw_id(&self) -> Uuid {
        self.0.0
    }
}
