//! Feed reader: cache-first timeline pages with store reconciliation.
//!
//! A page is served from exactly one path. When the viewer's timeline list
//! yields ids, the page is hydrated from snapshots and any misses are fetched
//! one by one from the primary store. When it yields nothing, the page comes
//! from the primary store's aggregation query against the live friend set.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::repos::{
    ContentRepo, FeedCandidateFilter, PageWindow, RelationshipRepo, RepoError,
};
use crate::cache::{SnapshotBatch, TimelineCache};
use crate::domain::entities::ContentItem;
use crate::domain::types::{ContentId, UserId};

const METRIC_FEED_READS: &str = "murmur_feed_reads_total";
const METRIC_FEED_BACKFILL: &str = "murmur_feed_backfill_total";
const METRIC_FEED_DROPPED: &str = "murmur_feed_dropped_total";

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_MAX_PAGE_SIZE: usize = 100;
const DEFAULT_BACKFILL_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub default_page_size: NonZeroUsize,
    pub max_page_size: NonZeroUsize,
    /// Individual store fetches in flight while backfilling one page.
    pub backfill_concurrency: NonZeroUsize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_page_size: NonZeroUsize::new(DEFAULT_PAGE_SIZE).unwrap_or(NonZeroUsize::MIN),
            max_page_size: NonZeroUsize::new(DEFAULT_MAX_PAGE_SIZE).unwrap_or(NonZeroUsize::MIN),
            backfill_concurrency: NonZeroUsize::new(DEFAULT_BACKFILL_CONCURRENCY)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl From<&crate::config::FeedSettings> for FeedConfig {
    fn from(settings: &crate::config::FeedSettings) -> Self {
        Self {
            default_page_size: settings.default_page_size,
            max_page_size: settings.max_page_size,
            backfill_concurrency: settings.backfill_concurrency,
        }
    }
}

/// A 1-based page request. `limit: None` uses the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRequest {
    pub page: u32,
    pub limit: Option<usize>,
}

impl FeedRequest {
    pub fn new(page: u32, limit: usize) -> Self {
        Self {
            page,
            limit: Some(limit),
        }
    }

    pub fn first_page() -> Self {
        Self {
            page: 1,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    Cache,
    Fallback,
}

impl FeedSource {
    fn as_str(self) -> &'static str {
        match self {
            FeedSource::Cache => "cache",
            FeedSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPage {
    pub viewer: UserId,
    pub page: u32,
    pub limit: usize,
    pub source: FeedSource,
    pub items: Vec<ContentItem>,
}

impl FeedPage {
    pub fn ids(&self) -> Vec<ContentId> {
        self.items.iter().map(|item| item.id).collect()
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("page numbers start at 1")]
    InvalidPage,
    #[error("failed to resolve friends of `{viewer}`: {source}")]
    Relationships {
        viewer: UserId,
        #[source]
        source: RepoError,
    },
    #[error("feed fallback query failed: {0}")]
    Candidates(#[source] RepoError),
}

#[derive(Clone)]
pub struct FeedReader {
    cache: Arc<dyn TimelineCache>,
    content: Arc<dyn ContentRepo>,
    relationships: Arc<dyn RelationshipRepo>,
    config: FeedConfig,
}

impl FeedReader {
    pub fn new(
        cache: Arc<dyn TimelineCache>,
        content: Arc<dyn ContentRepo>,
        relationships: Arc<dyn RelationshipRepo>,
        config: FeedConfig,
    ) -> Self {
        Self {
            cache,
            content,
            relationships,
            config,
        }
    }

    pub fn window(&self, request: FeedRequest) -> Result<PageWindow, FeedError> {
        if request.page == 0 {
            return Err(FeedError::InvalidPage);
        }
        let limit = request
            .limit
            .unwrap_or(self.config.default_page_size.get())
            .clamp(1, self.config.max_page_size.get());
        let offset = (request.page as usize - 1).saturating_mul(limit);
        Ok(PageWindow::new(offset, limit))
    }

    pub async fn read(&self, viewer: UserId, request: FeedRequest) -> Result<FeedPage, FeedError> {
        let window = self.window(request)?;

        let ids = match self
            .cache
            .range_slice(viewer, window.offset, window.limit)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(%viewer, error = %err, "Timeline read failed; serving fallback");
                Vec::new()
            }
        };

        let (source, items) = if ids.is_empty() {
            (FeedSource::Fallback, self.fallback(viewer, window).await?)
        } else {
            (FeedSource::Cache, self.hydrate(&ids).await)
        };

        counter!(METRIC_FEED_READS, "source" => source.as_str()).increment(1);
        debug!(
            %viewer,
            page = request.page,
            source = source.as_str(),
            items = items.len(),
            "Feed page served"
        );

        Ok(FeedPage {
            viewer,
            page: request.page,
            limit: window.limit,
            source,
            items,
        })
    }

    /// Resolve `ids` to items in the same order, backfilling snapshot misses
    /// from the primary store. Ids that cannot be fetched or are no longer
    /// active are dropped.
    async fn hydrate(&self, ids: &[ContentId]) -> Vec<ContentItem> {
        let batch = match self.cache.batch_get_snapshots(ids).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "Snapshot lookup failed; backfilling whole page");
                SnapshotBatch {
                    found: Vec::new(),
                    missing: ids.to_vec(),
                }
            }
        };

        let mut resolved: HashMap<ContentId, ContentItem> = HashMap::with_capacity(ids.len());
        for item in batch.found {
            if item.is_active() {
                resolved.insert(item.id, item);
            } else {
                self.forget_snapshot(item.id).await;
            }
        }

        let mut missing = batch.missing;
        missing.sort_unstable();
        missing.dedup();
        for item in self.backfill(missing).await {
            resolved.insert(item.id, item);
        }

        let items: Vec<ContentItem> = ids
            .iter()
            .filter_map(|id| resolved.get(id).cloned())
            .collect();
        let dropped = ids.len() - items.len();
        if dropped > 0 {
            counter!(METRIC_FEED_DROPPED).increment(dropped as u64);
        }
        items
    }

    async fn backfill(&self, missing: Vec<ContentId>) -> Vec<ContentItem> {
        if missing.is_empty() {
            return Vec::new();
        }
        counter!(METRIC_FEED_BACKFILL).increment(missing.len() as u64);

        let content = &self.content;
        let fetched: Vec<Option<ContentItem>> = stream::iter(missing)
            .map(|id| async move {
                match content.find_by_id(id).await {
                    Ok(Some(item)) if item.is_active() => Some(item),
                    Ok(Some(_)) => {
                        debug!(content_id = %id, "Dropping archived content from page");
                        None
                    }
                    Ok(None) => {
                        debug!(content_id = %id, "Dropping unknown content from page");
                        None
                    }
                    Err(err) => {
                        warn!(content_id = %id, error = %err, "Backfill fetch failed");
                        None
                    }
                }
            })
            .buffered(self.config.backfill_concurrency.get())
            .collect()
            .await;

        let items: Vec<ContentItem> = fetched.into_iter().flatten().collect();
        self.store_snapshots(&items).await;
        items
    }

    async fn fallback(
        &self,
        viewer: UserId,
        window: PageWindow,
    ) -> Result<Vec<ContentItem>, FeedError> {
        let friend_ids = self
            .relationships
            .friend_ids(viewer)
            .await
            .map_err(|source| FeedError::Relationships { viewer, source })?;

        let filter = FeedCandidateFilter::for_viewer(viewer, friend_ids);
        let items = self
            .content
            .query_feed_candidates(&filter, window)
            .await
            .map_err(FeedError::Candidates)?;

        self.store_snapshots(&items).await;
        Ok(items)
    }

    async fn store_snapshots(&self, items: &[ContentItem]) {
        for item in items {
            if let Err(err) = self.cache.set_snapshot(item).await {
                warn!(content_id = %item.id, error = %err, "Failed to store content snapshot");
            }
        }
    }

    async fn forget_snapshot(&self, id: ContentId) {
        debug!(content_id = %id, "Dropping archived snapshot");
        if let Err(err) = self.cache.invalidate_snapshot(id).await {
            warn!(content_id = %id, error = %err, "Failed to invalidate snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::cache::{CacheError, MemoryTimelineCache, TimelineCacheConfig};
    use crate::domain::types::{ContentStatus, Privacy, RelationshipStatus};

    fn user(n: u128) -> UserId {
        UserId(Uuid::from_u128(n))
    }

    fn content(n: u128) -> ContentId {
        ContentId(Uuid::from_u128(n))
    }

    fn item(n: u128, author: UserId, status: ContentStatus) -> ContentItem {
        ContentItem {
            id: content(n),
            author_id: author,
            privacy: Privacy::Public,
            status,
            body: format!("post {n}"),
            created_at: OffsetDateTime::UNIX_EPOCH + time::Duration::minutes(n as i64),
            author: None,
        }
    }

    #[derive(Default)]
    struct Fixture {
        items: Mutex<Vec<ContentItem>>,
        friends: Mutex<Vec<UserId>>,
        failing: Mutex<Vec<ContentId>>,
        fetches: Mutex<Vec<ContentId>>,
    }

    #[async_trait]
    impl ContentRepo for Fixture {
        async fn find_by_id(&self, id: ContentId) -> Result<Option<ContentItem>, RepoError> {
            self.fetches.lock().expect("fetches").push(id);
            if self.failing.lock().expect("failing").contains(&id) {
                return Err(RepoError::Timeout);
            }
            Ok(self
                .items
                .lock()
                .expect("items")
                .iter()
                .find(|item| item.id == id)
                .cloned())
        }

        async fn query_feed_candidates(
            &self,
            filter: &FeedCandidateFilter,
            window: PageWindow,
        ) -> Result<Vec<ContentItem>, RepoError> {
            let mut items: Vec<ContentItem> = self
                .items
                .lock()
                .expect("items")
                .iter()
                .filter(|item| filter.admits(item))
                .cloned()
                .collect();
            items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(items
                .into_iter()
                .skip(window.offset)
                .take(window.limit)
                .collect())
        }
    }

    #[async_trait]
    impl RelationshipRepo for Fixture {
        async fn friend_ids(&self, _user: UserId) -> Result<Vec<UserId>, RepoError> {
            Ok(self.friends.lock().expect("friends").clone())
        }

        async fn upsert_or_remove_edge(
            &self,
            _a: UserId,
            _b: UserId,
            _status: RelationshipStatus,
        ) -> Result<(), RepoError> {
            Ok(())
        }

        async fn sync_user_node(&self, _user: UserId) -> Result<(), RepoError> {
            Ok(())
        }
    }

    struct BrokenTimeline;

    #[async_trait]
    impl TimelineCache for BrokenTimeline {
        async fn push_and_trim(
            &self,
            _user: UserId,
            _content: ContentId,
            _max_len: NonZeroUsize,
        ) -> Result<usize, CacheError> {
            Err(CacheError::unavailable("down"))
        }

        async fn range_slice(
            &self,
            _user: UserId,
            _offset: usize,
            _limit: usize,
        ) -> Result<Vec<ContentId>, CacheError> {
            Err(CacheError::unavailable("down"))
        }

        async fn set_snapshot(&self, _item: &ContentItem) -> Result<(), CacheError> {
            Err(CacheError::unavailable("down"))
        }

        async fn get_snapshot(&self, _id: ContentId) -> Result<Option<ContentItem>, CacheError> {
            Err(CacheError::unavailable("down"))
        }

        async fn batch_get_snapshots(
            &self,
            _ids: &[ContentId],
        ) -> Result<SnapshotBatch, CacheError> {
            Err(CacheError::unavailable("down"))
        }

        async fn invalidate_snapshot(&self, _id: ContentId) -> Result<(), CacheError> {
            Err(CacheError::unavailable("down"))
        }
    }

    fn reader(cache: Arc<dyn TimelineCache>, fixture: Arc<Fixture>) -> FeedReader {
        FeedReader::new(cache, fixture.clone(), fixture, FeedConfig::default())
    }

    fn memory_cache() -> Arc<MemoryTimelineCache> {
        Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::default()))
    }

    async fn push(cache: &MemoryTimelineCache, viewer: UserId, ids: &[ContentId]) {
        for id in ids {
            cache
                .push_and_trim(viewer, *id, NonZeroUsize::new(500).expect("bound"))
                .await
                .expect("push");
        }
    }

    #[test]
    fn window_clamps_limit_and_rejects_page_zero() {
        let reader = reader(memory_cache(), Arc::new(Fixture::default()));

        assert_eq!(
            reader.window(FeedRequest::new(3, 10)).expect("window"),
            PageWindow::new(20, 10)
        );
        assert_eq!(
            reader.window(FeedRequest::new(1, 0)).expect("window").limit,
            1
        );
        assert_eq!(
            reader.window(FeedRequest::new(1, 10_000)).expect("window").limit,
            100
        );
        assert_eq!(
            reader.window(FeedRequest::first_page()).expect("window").limit,
            20
        );
        assert!(matches!(
            reader.window(FeedRequest::new(0, 10)),
            Err(FeedError::InvalidPage)
        ));
    }

    #[tokio::test]
    async fn cache_path_preserves_timeline_order_and_backfills() {
        let viewer = user(1);
        let author = user(2);
        let fixture = Arc::new(Fixture::default());
        *fixture.items.lock().expect("items") = (1..=3u128)
            .map(|n| item(n, author, ContentStatus::Active))
            .collect();
        let cache = memory_cache();
        push(&cache, viewer, &[content(1), content(2), content(3)]).await;
        cache
            .set_snapshot(&item(2, author, ContentStatus::Active))
            .await
            .expect("snapshot");

        let page = reader(cache.clone(), fixture.clone())
            .read(viewer, FeedRequest::new(1, 10))
            .await
            .expect("page");

        assert_eq!(page.source, FeedSource::Cache);
        assert_eq!(page.ids(), vec![content(3), content(2), content(1)]);
        assert_eq!(
            *fixture.fetches.lock().expect("fetches"),
            vec![content(1), content(3)]
        );
        assert!(cache.get_snapshot(content(1)).await.expect("get").is_some());
        assert!(cache.get_snapshot(content(3)).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn failed_and_archived_ids_are_dropped_from_cache_page() {
        let viewer = user(1);
        let author = user(2);
        let fixture = Arc::new(Fixture::default());
        *fixture.items.lock().expect("items") = vec![
            item(1, author, ContentStatus::Active),
            item(2, author, ContentStatus::Archived),
            item(3, author, ContentStatus::Active),
        ];
        fixture.failing.lock().expect("failing").push(content(3));
        let cache = memory_cache();
        push(&cache, viewer, &[content(1), content(2), content(3), content(4)]).await;

        let page = reader(cache.clone(), fixture)
            .read(viewer, FeedRequest::new(1, 10))
            .await
            .expect("page");

        assert_eq!(page.source, FeedSource::Cache);
        assert_eq!(page.ids(), vec![content(1)]);
        assert!(cache.get_snapshot(content(2)).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn archived_snapshot_is_filtered_and_evicted() {
        let viewer = user(1);
        let archived = item(5, user(2), ContentStatus::Archived);
        let cache = memory_cache();
        push(&cache, viewer, &[archived.id]).await;
        cache.set_snapshot(&archived).await.expect("snapshot");

        let page = reader(cache.clone(), Arc::new(Fixture::default()))
            .read(viewer, FeedRequest::new(1, 10))
            .await
            .expect("page");

        assert!(page.items.is_empty());
        assert_eq!(page.source, FeedSource::Cache);
        assert!(cache.snapshots().is_empty());
    }

    #[tokio::test]
    async fn empty_timeline_uses_fallback_query() {
        let viewer = user(1);
        let friend = user(2);
        let stranger = user(3);
        let fixture = Arc::new(Fixture::default());
        fixture.friends.lock().expect("friends").push(friend);
        let mut own = item(1, viewer, ContentStatus::Active);
        own.privacy = Privacy::SelfOnly;
        *fixture.items.lock().expect("items") = vec![
            own,
            item(2, friend, ContentStatus::Active),
            item(3, stranger, ContentStatus::Active),
            item(4, friend, ContentStatus::Archived),
        ];
        let cache = memory_cache();

        let page = reader(cache.clone(), fixture)
            .read(viewer, FeedRequest::new(1, 10))
            .await
            .expect("page");

        assert_eq!(page.source, FeedSource::Fallback);
        assert_eq!(page.ids(), vec![content(2), content(1)]);
        assert_eq!(cache.snapshots().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_cache_degrades_to_fallback() {
        let viewer = user(1);
        let fixture = Arc::new(Fixture::default());
        let mut own = item(7, viewer, ContentStatus::Active);
        own.created_at = datetime!(2025-01-01 00:00 UTC);
        fixture.items.lock().expect("items").push(own);

        let page = reader(Arc::new(BrokenTimeline), fixture)
            .read(viewer, FeedRequest::new(1, 5))
            .await
            .expect("page");

        assert_eq!(page.source, FeedSource::Fallback);
        assert_eq!(page.ids(), vec![content(7)]);
    }

    #[tokio::test]
    async fn second_page_reads_further_into_timeline() {
        let viewer = user(1);
        let author = user(2);
        let fixture = Arc::new(Fixture::default());
        *fixture.items.lock().expect("items") = (1..=5u128)
            .map(|n| item(n, author, ContentStatus::Active))
            .collect();
        let cache = memory_cache();
        push(&cache, viewer, &(1..=5u128).map(content).collect::<Vec<_>>()).await;

        let page = reader(cache, fixture)
            .read(viewer, FeedRequest::new(2, 2))
            .await
            .expect("page");

        assert_eq!(page.ids(), vec![content(3), content(2)]);
    }
}
