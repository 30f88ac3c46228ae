//! Content snapshot storage.
//!
//! Snapshots are serialized copies of `ContentItem` with an expiry, held in an
//! LRU. They are independent of timeline lists: an id can sit in a timeline
//! with no snapshot, which readers treat as a miss.

use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;
use tracing::warn;

use crate::domain::entities::ContentItem;
use crate::domain::types::ContentId;

use super::config::TimelineCacheConfig;
use super::keys::{CacheNamespace, SnapshotKey};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::snapshot";

const METRIC_SNAPSHOT_HIT: &str = "murmur_snapshot_hit_total";
const METRIC_SNAPSHOT_MISS: &str = "murmur_snapshot_miss_total";
const METRIC_SNAPSHOT_EVICT: &str = "murmur_snapshot_evict_total";

struct SnapshotEntry {
    payload: Bytes,
    /// `None` when the lifetime runs past the clock's range.
    expires_at: Option<Instant>,
}

/// Ids found and not found by a batch lookup, each in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotBatch {
    pub found: Vec<ContentItem>,
    pub missing: Vec<ContentId>,
}

pub struct SnapshotStore {
    entries: RwLock<LruCache<SnapshotKey, SnapshotEntry>>,
    ttl: Duration,
}

impl SnapshotStore {
    pub fn new(config: &TimelineCacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.snapshot_limit_non_zero())),
            ttl: config.snapshot_ttl(),
        }
    }

    /// Serialize and store `item`, replacing any previous snapshot.
    pub fn set(&self, item: &ContentItem) -> Result<(), serde_json::Error> {
        let payload = Bytes::from(serde_json::to_vec(item)?);
        let entry = SnapshotEntry {
            payload,
            expires_at: Instant::now().checked_add(self.ttl),
        };

        let evicted =
            rw_write(&self.entries, SOURCE, "set").push(SnapshotKey::from(item.id), entry);
        if let Some((key, _)) = evicted
            && key != SnapshotKey::from(item.id)
        {
            counter!(METRIC_SNAPSHOT_EVICT).increment(1);
        }
        Ok(())
    }

    pub fn get(&self, id: ContentId) -> Option<ContentItem> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let item = lookup(&mut entries, SnapshotKey::from(id), now);
        record_lookup(item.is_some());
        item
    }

    /// Look up many snapshots under one lock acquisition.
    pub fn batch_get(&self, ids: &[ContentId]) -> SnapshotBatch {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "batch_get");
        let mut batch = SnapshotBatch::default();

        for id in ids {
            match lookup(&mut entries, SnapshotKey::from(*id), now) {
                Some(item) => {
                    record_lookup(true);
                    batch.found.push(item);
                }
                None => {
                    record_lookup(false);
                    batch.missing.push(*id);
                }
            }
        }

        batch
    }

    pub fn invalidate(&self, id: ContentId) -> bool {
        rw_write(&self.entries, SOURCE, "invalidate")
            .pop(&SnapshotKey::from(id))
            .is_some()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lookup(
    entries: &mut LruCache<SnapshotKey, SnapshotEntry>,
    key: SnapshotKey,
    now: Instant,
) -> Option<ContentItem> {
    let entry = entries.get(&key)?;
    if entry.expires_at.is_some_and(|expires_at| expires_at <= now) {
        entries.pop(&key);
        return None;
    }

    match serde_json::from_slice::<ContentItem>(&entry.payload) {
        Ok(item) => Some(item),
        Err(err) => {
            warn!(
                key = %key.render(),
                error = %err,
                "Dropping undecodable content snapshot"
            );
            entries.pop(&key);
            None
        }
    }
}

fn record_lookup(hit: bool) {
    if hit {
        counter!(METRIC_SNAPSHOT_HIT).increment(1);
    } else {
        counter!(METRIC_SNAPSHOT_MISS).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;
    use crate::domain::entities::AuthorSummary;
    use crate::domain::types::{ContentStatus, Privacy, UserId};

    fn sample_item(n: u128) -> ContentItem {
        ContentItem {
            id: ContentId(Uuid::from_u128(n)),
            author_id: UserId(Uuid::from_u128(1_000)),
            privacy: Privacy::Public,
            status: ContentStatus::Active,
            body: format!("post {n}"),
            created_at: OffsetDateTime::UNIX_EPOCH,
            author: Some(AuthorSummary {
                display_name: "Ada".to_string(),
                avatar_url: None,
            }),
        }
    }

    #[test]
    fn snapshot_roundtrip_and_invalidate() {
        let store = SnapshotStore::new(&TimelineCacheConfig::default());
        let item = sample_item(1);

        assert!(store.get(item.id).is_none());
        store.set(&item).expect("encode snapshot");
        assert_eq!(store.get(item.id), Some(item.clone()));

        assert!(store.invalidate(item.id));
        assert!(store.get(item.id).is_none());
    }

    #[test]
    fn batch_get_reports_missing_in_order() {
        let store = SnapshotStore::new(&TimelineCacheConfig::default());
        let first = sample_item(1);
        let third = sample_item(3);
        store.set(&first).expect("encode");
        store.set(&third).expect("encode");

        let ids = [
            first.id,
            ContentId(Uuid::from_u128(2)),
            third.id,
            ContentId(Uuid::from_u128(4)),
        ];
        let batch = store.batch_get(&ids);

        assert_eq!(batch.found, vec![first, third]);
        assert_eq!(
            batch.missing,
            vec![ContentId(Uuid::from_u128(2)), ContentId(Uuid::from_u128(4))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_expire_after_ttl() {
        let config = TimelineCacheConfig {
            snapshot_ttl_secs: 10,
            ..Default::default()
        };
        let store = SnapshotStore::new(&config);
        let item = sample_item(1);
        store.set(&item).expect("encode");

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get(item.id).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get(item.id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn unbounded_ttl_never_expires() {
        let config = TimelineCacheConfig {
            snapshot_ttl_secs: u64::MAX,
            ..Default::default()
        };
        let store = SnapshotStore::new(&config);
        let item = sample_item(1);

        store.set(&item).expect("encode");
        assert_eq!(store.get(item.id), Some(item));
    }

    #[test]
    fn lru_eviction_drops_oldest() {
        let config = TimelineCacheConfig {
            snapshot_limit: 2,
            ..Default::default()
        };
        let store = SnapshotStore::new(&config);

        store.set(&sample_item(1)).expect("encode");
        store.set(&sample_item(2)).expect("encode");
        store.set(&sample_item(3)).expect("encode");

        assert!(store.get(ContentId(Uuid::from_u128(1))).is_none());
        assert!(store.get(ContentId(Uuid::from_u128(2))).is_some());
        assert!(store.get(ContentId(Uuid::from_u128(3))).is_some());
    }

    #[test]
    fn corrupt_payload_is_a_miss() {
        let store = SnapshotStore::new(&TimelineCacheConfig::default());
        let id = ContentId(Uuid::from_u128(5));
        rw_write(&store.entries, SOURCE, "test").put(
            SnapshotKey::from(id),
            SnapshotEntry {
                payload: Bytes::from_static(b"{not json"),
                expires_at: Instant::now().checked_add(Duration::from_secs(60)),
            },
        );

        let batch = store.batch_get(&[id]);
        assert!(batch.found.is_empty());
        assert_eq!(batch.missing, vec![id]);
        assert!(store.is_empty());
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = SnapshotStore::new(&TimelineCacheConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("snapshot lock should be acquired");
            panic!("poison snapshot lock");
        }));

        store.set(&sample_item(1)).expect("encode");
        assert_eq!(store.len(), 1);
    }
}
