//! In-process adapters with the same semantics as the Postgres ones.
//!
//! Used by the integration tests and by `murmur demo`.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::application::repos::{
    ContentRepo, ContentWriteRepo, FeedCandidateFilter, NewContent, PageWindow, ProfileRepo,
    RelationshipRepo, RepoError,
};
use crate::application::stream::{EventPublisher, EventStream, StreamError, StreamRecord};
use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::domain::entities::{AuthorProfile, ContentItem};
use crate::domain::events::Topic;
use crate::domain::types::{ContentId, ContentStatus, RelationshipStatus, UserId};

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct StoreState {
    users: BTreeSet<UserId>,
    edges: HashMap<UserId, BTreeSet<UserId>>,
    content: HashMap<ContentId, ContentItem>,
    profiles: HashMap<UserId, AuthorProfile>,
}

impl StoreState {
    fn with_author(&self, mut item: ContentItem) -> ContentItem {
        item.author = self.profiles.get(&item.author_id).map(AuthorProfile::summary);
        item
    }
}

/// Primary store, relationship graph, and profile replica in one place.
#[derive(Clone, Default)]
pub struct MemoryRepositories {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "user_count").users.len()
    }

    pub fn content_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "content_count").content.len()
    }
}

#[async_trait]
impl ContentRepo for MemoryRepositories {
    async fn find_by_id(&self, id: ContentId) -> Result<Option<ContentItem>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "find_by_id");
        Ok(state
            .content
            .get(&id)
            .cloned()
            .map(|item| state.with_author(item)))
    }

    async fn query_feed_candidates(
        &self,
        filter: &FeedCandidateFilter,
        window: PageWindow,
    ) -> Result<Vec<ContentItem>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "query_feed_candidates");
        let mut items: Vec<&ContentItem> = state
            .content
            .values()
            .filter(|item| filter.admits(item))
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(items
            .into_iter()
            .skip(window.offset)
            .take(window.limit)
            .map(|item| state.with_author(item.clone()))
            .collect())
    }
}

#[async_trait]
impl ContentWriteRepo for MemoryRepositories {
    async fn insert_content(&self, params: NewContent) -> Result<ContentItem, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "insert_content");
        if state.content.contains_key(&params.id) {
            return Err(RepoError::invalid_input(format!(
                "content `{}` already exists",
                params.id
            )));
        }

        let item = ContentItem {
            id: params.id,
            author_id: params.author_id,
            privacy: params.privacy,
            status: ContentStatus::Active,
            body: params.body,
            created_at: params.created_at,
            author: None,
        };
        state.users.insert(item.author_id);
        state.content.insert(item.id, item.clone());
        Ok(state.with_author(item))
    }

    async fn set_status(
        &self,
        id: ContentId,
        status: ContentStatus,
    ) -> Result<ContentItem, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "set_status");
        let item = state.content.get_mut(&id).ok_or(RepoError::NotFound)?;
        item.status = status;
        let item = item.clone();
        Ok(state.with_author(item))
    }
}

#[async_trait]
impl RelationshipRepo for MemoryRepositories {
    async fn friend_ids(&self, user: UserId) -> Result<Vec<UserId>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "friend_ids");
        Ok(state
            .edges
            .get(&user)
            .map(|friends| friends.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn upsert_or_remove_edge(
        &self,
        user_a: UserId,
        user_b: UserId,
        status: RelationshipStatus,
    ) -> Result<(), RepoError> {
        if user_a == user_b {
            return Err(RepoError::invalid_input("self edges are not allowed"));
        }

        let mut state = rw_write(&self.state, SOURCE, "upsert_or_remove_edge");
        if status.creates_edge() {
            state.users.insert(user_a);
            state.users.insert(user_b);
            state.edges.entry(user_a).or_default().insert(user_b);
            state.edges.entry(user_b).or_default().insert(user_a);
        } else {
            for (from, to) in [(user_a, user_b), (user_b, user_a)] {
                if let Some(friends) = state.edges.get_mut(&from) {
                    friends.remove(&to);
                }
            }
        }
        Ok(())
    }

    async fn sync_user_node(&self, user: UserId) -> Result<(), RepoError> {
        rw_write(&self.state, SOURCE, "sync_user_node")
            .users
            .insert(user);
        Ok(())
    }
}

#[async_trait]
impl ProfileRepo for MemoryRepositories {
    async fn upsert_profile(&self, profile: &AuthorProfile) -> Result<(), RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "upsert_profile");
        state.users.insert(profile.user_id);
        let stale = state
            .profiles
            .get(&profile.user_id)
            .is_some_and(|current| current.updated_at > profile.updated_at);
        if !stale {
            state.profiles.insert(profile.user_id, profile.clone());
        }
        Ok(())
    }

    async fn find_profile(&self, user: UserId) -> Result<Option<AuthorProfile>, RepoError> {
        Ok(rw_read(&self.state, SOURCE, "find_profile")
            .profiles
            .get(&user)
            .cloned())
    }
}

type PartitionKey = (Topic, u32);

#[derive(Default)]
struct BusState {
    logs: HashMap<PartitionKey, Vec<Bytes>>,
    /// Last handled offset per (group, topic, partition).
    committed: HashMap<(String, Topic, u32), i64>,
}

/// Partitioned in-process event log with per-group committed offsets.
#[derive(Clone)]
pub struct MemoryEventBus {
    partitions: NonZeroU32,
    state: Arc<Mutex<BusState>>,
}

impl MemoryEventBus {
    pub fn new(partitions: NonZeroU32) -> Self {
        Self {
            partitions,
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Streams for every (topic, partition), resuming after the group's
    /// committed offsets.
    pub fn open_streams(&self, consumer_group: &str) -> Vec<Arc<dyn EventStream>> {
        let state = mutex_lock(&self.state, SOURCE, "open_streams");
        let mut streams: Vec<Arc<dyn EventStream>> = Vec::new();
        for topic in Topic::ALL {
            for partition in 0..self.partitions.get() {
                let next_offset = state
                    .committed
                    .get(&(consumer_group.to_string(), topic, partition))
                    .map(|offset| offset + 1)
                    .unwrap_or(0);
                streams.push(Arc::new(MemoryEventStream {
                    bus: self.clone(),
                    consumer_group: consumer_group.to_string(),
                    topic,
                    partition,
                    next_offset: Mutex::new(next_offset),
                }));
            }
        }
        streams
    }

    /// Records the group has not committed yet, across all partitions.
    pub fn pending(&self, consumer_group: &str) -> usize {
        let state = mutex_lock(&self.state, SOURCE, "pending");
        state
            .logs
            .iter()
            .map(|((topic, partition), log)| {
                let handled = state
                    .committed
                    .get(&(consumer_group.to_string(), *topic, *partition))
                    .map(|offset| (offset + 1) as usize)
                    .unwrap_or(0);
                log.len().saturating_sub(handled)
            })
            .sum()
    }

    pub fn committed(&self, consumer_group: &str, topic: Topic, partition: u32) -> Option<i64> {
        mutex_lock(&self.state, SOURCE, "committed")
            .committed
            .get(&(consumer_group.to_string(), topic, partition))
            .copied()
    }

    /// Forget a group's position, as if its offsets were never written.
    pub fn reset_group(&self, consumer_group: &str) {
        mutex_lock(&self.state, SOURCE, "reset_group")
            .committed
            .retain(|(group, _, _), _| group != consumer_group);
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    fn partitions(&self) -> NonZeroU32 {
        self.partitions
    }

    async fn append(
        &self,
        topic: Topic,
        partition: u32,
        payload: Bytes,
    ) -> Result<i64, StreamError> {
        if partition >= self.partitions.get() {
            return Err(StreamError::unavailable(format!(
                "partition {partition} does not exist"
            )));
        }
        let mut state = mutex_lock(&self.state, SOURCE, "append");
        let log = state.logs.entry((topic, partition)).or_default();
        log.push(payload);
        Ok(log.len() as i64 - 1)
    }
}

pub struct MemoryEventStream {
    bus: MemoryEventBus,
    consumer_group: String,
    topic: Topic,
    partition: u32,
    next_offset: Mutex<i64>,
}

#[async_trait]
impl EventStream for MemoryEventStream {
    fn topic(&self) -> Topic {
        self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_batch(&self, max: usize) -> Result<Vec<StreamRecord>, StreamError> {
        let mut next_offset = mutex_lock(&self.next_offset, SOURCE, "next_batch");
        let state = mutex_lock(&self.bus.state, SOURCE, "next_batch");
        let Some(log) = state.logs.get(&(self.topic, self.partition)) else {
            return Ok(Vec::new());
        };

        let start = usize::try_from(*next_offset).unwrap_or(0);
        let records: Vec<StreamRecord> = log
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, payload)| StreamRecord {
                topic: self.topic,
                partition: self.partition,
                offset: offset as i64,
                payload: payload.clone(),
            })
            .collect();

        if let Some(last) = records.last() {
            *next_offset = last.offset + 1;
        }
        Ok(records)
    }

    async fn commit(&self, record: &StreamRecord) -> Result<(), StreamError> {
        let mut state = mutex_lock(&self.bus.state, SOURCE, "commit");
        let committed = state
            .committed
            .entry((self.consumer_group.clone(), record.topic, record.partition))
            .or_insert(record.offset);
        *committed = (*committed).max(record.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;
    use crate::domain::types::Privacy;

    fn user(n: u128) -> UserId {
        UserId(Uuid::from_u128(n))
    }

    fn partitions(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).expect("non-zero")
    }

    #[tokio::test]
    async fn edges_are_symmetric_and_removable() {
        let repos = MemoryRepositories::new();
        repos
            .upsert_or_remove_edge(user(1), user(2), RelationshipStatus::Accepted)
            .await
            .expect("accept");
        repos
            .upsert_or_remove_edge(user(2), user(1), RelationshipStatus::Accepted)
            .await
            .expect("accept again");

        assert_eq!(repos.friend_ids(user(1)).await.expect("friends"), vec![user(2)]);
        assert_eq!(repos.friend_ids(user(2)).await.expect("friends"), vec![user(1)]);

        repos
            .upsert_or_remove_edge(user(2), user(1), RelationshipStatus::Blocked)
            .await
            .expect("block");
        assert!(repos.friend_ids(user(1)).await.expect("friends").is_empty());
        assert!(repos.friend_ids(user(2)).await.expect("friends").is_empty());
    }

    #[tokio::test]
    async fn content_is_joined_with_profile() {
        let repos = MemoryRepositories::new();
        repos
            .upsert_profile(&AuthorProfile {
                user_id: user(1),
                display_name: "Ada".to_string(),
                avatar_url: None,
                updated_at: OffsetDateTime::UNIX_EPOCH,
            })
            .await
            .expect("profile");
        let item = repos
            .insert_content(NewContent {
                id: ContentId::new(),
                author_id: user(1),
                privacy: Privacy::Public,
                body: "hi".to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .await
            .expect("insert");

        let author = item.author.expect("author summary");
        assert_eq!(author.display_name, "Ada");
    }

    #[tokio::test]
    async fn older_profile_does_not_overwrite_newer() {
        let repos = MemoryRepositories::new();
        let newer = AuthorProfile {
            user_id: user(1),
            display_name: "New".to_string(),
            avatar_url: None,
            updated_at: OffsetDateTime::UNIX_EPOCH + time::Duration::hours(1),
        };
        let older = AuthorProfile {
            display_name: "Old".to_string(),
            updated_at: OffsetDateTime::UNIX_EPOCH,
            ..newer.clone()
        };

        repos.upsert_profile(&newer).await.expect("newer");
        repos.upsert_profile(&older).await.expect("older");

        let stored = repos.find_profile(user(1)).await.expect("find").expect("profile");
        assert_eq!(stored.display_name, "New");
    }

    #[tokio::test]
    async fn bus_redelivers_uncommitted_records_to_a_new_stream() {
        let bus = MemoryEventBus::new(partitions(1));
        for n in 0..3u8 {
            bus.append(Topic::Profile, 0, Bytes::from(vec![n]))
                .await
                .expect("append");
        }

        let stream = bus
            .open_streams("feed")
            .into_iter()
            .find(|stream| stream.topic() == Topic::Profile)
            .expect("profile stream");
        let batch = stream.next_batch(10).await.expect("batch");
        assert_eq!(batch.len(), 3);
        stream.commit(&batch[0]).await.expect("commit");
        assert_eq!(bus.pending("feed"), 2);

        let reopened = bus
            .open_streams("feed")
            .into_iter()
            .find(|stream| stream.topic() == Topic::Profile)
            .expect("profile stream");
        let replay = reopened.next_batch(10).await.expect("replay");
        assert_eq!(
            replay.iter().map(|record| record.offset).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn append_rejects_unknown_partition() {
        let bus = MemoryEventBus::new(partitions(2));
        assert!(bus
            .append(Topic::Content, 2, Bytes::from_static(b"{}"))
            .await
            .is_err());
    }
}
