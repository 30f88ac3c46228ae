//! The timeline cache contract and its in-process implementation.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::domain::entities::ContentItem;
use crate::domain::types::{ContentId, UserId};

use super::config::TimelineCacheConfig;
use super::snapshot::{SnapshotBatch, SnapshotStore};
use super::timeline::TimelineStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode snapshot for content `{content_id}`: {source}")]
    Encode {
        content_id: ContentId,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Operations the fan-out writer and feed reader need from the cache.
///
/// Every entry is advisory: an empty list or missing snapshot is a normal
/// state, never corruption.
#[async_trait]
pub trait TimelineCache: Send + Sync {
    /// Atomically prepend `content` to `user`'s list and trim it to `max_len`.
    /// Returns the list length afterwards.
    async fn push_and_trim(
        &self,
        user: UserId,
        content: ContentId,
        max_len: NonZeroUsize,
    ) -> Result<usize, CacheError>;

    /// Ids in list order; empty when the list is absent or expired.
    async fn range_slice(
        &self,
        user: UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ContentId>, CacheError>;

    async fn set_snapshot(&self, item: &ContentItem) -> Result<(), CacheError>;

    async fn get_snapshot(&self, id: ContentId) -> Result<Option<ContentItem>, CacheError>;

    async fn batch_get_snapshots(&self, ids: &[ContentId]) -> Result<SnapshotBatch, CacheError>;

    async fn invalidate_snapshot(&self, id: ContentId) -> Result<(), CacheError>;
}

/// Timeline lists and snapshots held in this process.
pub struct MemoryTimelineCache {
    timelines: TimelineStore,
    snapshots: SnapshotStore,
}

impl MemoryTimelineCache {
    pub fn new(config: &TimelineCacheConfig) -> Self {
        Self {
            timelines: TimelineStore::new(config.timeline_ttl()),
            snapshots: SnapshotStore::new(config),
        }
    }

    pub fn timelines(&self) -> &TimelineStore {
        &self.timelines
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Periodically drop timeline lists that went idle past the TTL, so
    /// users who never read again do not pin memory. Stops once `shutdown`
    /// flips to `true` or its sender is dropped.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.timelines.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "swept idle timelines");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl TimelineCache for MemoryTimelineCache {
    async fn push_and_trim(
        &self,
        user: UserId,
        content: ContentId,
        max_len: NonZeroUsize,
    ) -> Result<usize, CacheError> {
        Ok(self.timelines.push_and_trim(user, content, max_len).len)
    }

    async fn range_slice(
        &self,
        user: UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ContentId>, CacheError> {
        Ok(self.timelines.range_slice(user, offset, limit))
    }

    async fn set_snapshot(&self, item: &ContentItem) -> Result<(), CacheError> {
        self.snapshots
            .set(item)
            .map_err(|source| CacheError::Encode {
                content_id: item.id,
                source,
            })
    }

    async fn get_snapshot(&self, id: ContentId) -> Result<Option<ContentItem>, CacheError> {
        Ok(self.snapshots.get(id))
    }

    async fn batch_get_snapshots(&self, ids: &[ContentId]) -> Result<SnapshotBatch, CacheError> {
        Ok(self.snapshots.batch_get(ids))
    }

    async fn invalidate_snapshot(&self, id: ContentId) -> Result<(), CacheError> {
        self.snapshots.invalidate(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::domain::types::{ContentStatus, Privacy};

    #[tokio::test]
    async fn memory_cache_serves_both_namespaces() {
        let cache = MemoryTimelineCache::new(&TimelineCacheConfig::default());
        let user = UserId::new();
        let item = ContentItem {
            id: ContentId::new(),
            author_id: user,
            privacy: Privacy::SelfOnly,
            status: ContentStatus::Active,
            body: "hello".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            author: None,
        };

        let len = cache
            .push_and_trim(user, item.id, NonZeroUsize::MIN)
            .await
            .expect("push");
        assert_eq!(len, 1);
        assert_eq!(
            cache.range_slice(user, 0, 10).await.expect("slice"),
            vec![item.id]
        );

        cache.set_snapshot(&item).await.expect("set snapshot");
        assert_eq!(
            cache.get_snapshot(item.id).await.expect("get snapshot"),
            Some(item.clone())
        );

        cache.invalidate_snapshot(item.id).await.expect("invalidate");
        assert!(cache.get_snapshot(item.id).await.expect("get").is_none());
        assert_eq!(cache.timelines().len(user), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_lists_until_shutdown() {
        let cache = Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig {
            timeline_ttl_secs: 60,
            ..TimelineCacheConfig::default()
        }));
        let user = UserId::new();
        cache
            .push_and_trim(user, ContentId::new(), NonZeroUsize::MIN)
            .await
            .expect("push");

        let (shutdown, receiver) = watch::channel(false);
        let sweeper = cache.clone().spawn_sweeper(Duration::from_secs(30), receiver);

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(cache.timelines().user_count(), 0);

        shutdown.send(true).expect("sweeper listening");
        sweeper.await.expect("sweeper exits");
    }
}
