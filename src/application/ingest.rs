//! Event ingestor: one consumer loop per (topic, partition).
//!
//! Every loop is independent, so a stalled partition never blocks another.
//! Records are handled in offset order and committed after their handler
//! returns, whatever the outcome. Nothing is retried here.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::fanout::{FanoutError, FanoutWriter};
use crate::application::repos::{ProfileRepo, RelationshipRepo};
use crate::application::stream::{EventStream, StreamRecord};
use crate::cache::TimelineCache;
use crate::domain::entities::AuthorProfile;
use crate::domain::events::{ContentEvent, ProfileUpdated, RelationshipChanged, Topic};

const METRIC_INGEST_EVENTS: &str = "murmur_ingest_events_total";
const METRIC_INGEST_SKIPPED: &str = "murmur_ingest_skipped_total";
const METRIC_INGEST_FAILED: &str = "murmur_ingest_failed_total";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Pause after an empty batch or a broker error.
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 64,
        }
    }
}

impl From<&crate::config::IngestSettings> for IngestConfig {
    fn from(settings: &crate::config::IngestSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size.get(),
        }
    }
}

/// What happened to a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Handled,
    /// Undecodable or invalid payload.
    Skipped,
    /// The handler gave up; logged, not retried.
    Failed,
}

impl HandleOutcome {
    fn as_str(self) -> &'static str {
        match self {
            HandleOutcome::Handled => "handled",
            HandleOutcome::Skipped => "skipped",
            HandleOutcome::Failed => "failed",
        }
    }
}

/// Per-topic handlers shared by every consumer loop.
pub struct EventHandlers {
    fanout: FanoutWriter,
    cache: Arc<dyn TimelineCache>,
    relationships: Arc<dyn RelationshipRepo>,
    profiles: Arc<dyn ProfileRepo>,
}

impl EventHandlers {
    pub fn new(
        fanout: FanoutWriter,
        cache: Arc<dyn TimelineCache>,
        relationships: Arc<dyn RelationshipRepo>,
        profiles: Arc<dyn ProfileRepo>,
    ) -> Self {
        Self {
            fanout,
            cache,
            relationships,
            profiles,
        }
    }

    pub async fn handle(&self, record: &StreamRecord) -> HandleOutcome {
        let outcome = match record.topic {
            Topic::Content => self.handle_content(record).await,
            Topic::Relationship => self.handle_relationship(record).await,
            Topic::Profile => self.handle_profile(record).await,
        };

        let topic = record.topic.as_str();
        counter!(METRIC_INGEST_EVENTS, "topic" => topic).increment(1);
        match outcome {
            HandleOutcome::Skipped => {
                counter!(METRIC_INGEST_SKIPPED, "topic" => topic).increment(1);
            }
            HandleOutcome::Failed => {
                counter!(METRIC_INGEST_FAILED, "topic" => topic).increment(1);
            }
            HandleOutcome::Handled => {}
        }
        outcome
    }

    async fn handle_content(&self, record: &StreamRecord) -> HandleOutcome {
        let Some(event) = decode::<ContentEvent>(record) else {
            return HandleOutcome::Skipped;
        };

        match event {
            ContentEvent::Created(created) => match self.fanout.fan_out(&created).await {
                Ok(report) => {
                    for failure in &report.failures {
                        warn!(
                            content_id = %report.content_id,
                            recipient = %failure.recipient,
                            error = %failure.error,
                            "Timeline push failed"
                        );
                    }
                    info!(
                        content_id = %report.content_id,
                        recipients = report.recipients,
                        delivered = report.delivered,
                        failed = report.failures.len(),
                        snapshot = report.snapshot_written,
                        "Content fanned out"
                    );
                    HandleOutcome::Handled
                }
                Err(FanoutError::InvalidEvent(err)) => {
                    debug!(offset = record.offset, error = %err, "Skipping invalid content event");
                    HandleOutcome::Skipped
                }
                Err(err) => {
                    warn!(
                        content_id = %created.content_id,
                        error = %err,
                        "Fan-out abandoned"
                    );
                    HandleOutcome::Failed
                }
            },
            ContentEvent::Edited(changed) | ContentEvent::Archived(changed) => {
                match self.cache.invalidate_snapshot(changed.content_id).await {
                    Ok(()) => {
                        debug!(content_id = %changed.content_id, "Snapshot invalidated");
                        HandleOutcome::Handled
                    }
                    Err(err) => {
                        warn!(
                            content_id = %changed.content_id,
                            error = %err,
                            "Snapshot invalidation failed"
                        );
                        HandleOutcome::Failed
                    }
                }
            }
        }
    }

    async fn handle_relationship(&self, record: &StreamRecord) -> HandleOutcome {
        let Some(event) = decode::<RelationshipChanged>(record) else {
            return HandleOutcome::Skipped;
        };
        if let Err(err) = event.validate() {
            debug!(offset = record.offset, error = %err, "Skipping invalid relationship event");
            return HandleOutcome::Skipped;
        }

        match self
            .relationships
            .upsert_or_remove_edge(event.user_a, event.user_b, event.status)
            .await
        {
            Ok(()) => {
                info!(
                    user_a = %event.user_a,
                    user_b = %event.user_b,
                    status = event.status.as_str(),
                    "Relationship edge updated"
                );
                HandleOutcome::Handled
            }
            Err(err) => {
                warn!(
                    user_a = %event.user_a,
                    user_b = %event.user_b,
                    error = %err,
                    "Relationship update failed"
                );
                HandleOutcome::Failed
            }
        }
    }

    async fn handle_profile(&self, record: &StreamRecord) -> HandleOutcome {
        let Some(event) = decode::<ProfileUpdated>(record) else {
            return HandleOutcome::Skipped;
        };
        if let Err(err) = event.validate() {
            debug!(offset = record.offset, error = %err, "Skipping invalid profile event");
            return HandleOutcome::Skipped;
        }

        let profile = AuthorProfile {
            user_id: event.user_id,
            display_name: event.display_name,
            avatar_url: event.avatar_url,
            updated_at: event.updated_at,
        };

        if let Err(err) = self.profiles.upsert_profile(&profile).await {
            warn!(user_id = %profile.user_id, error = %err, "Profile replica update failed");
            return HandleOutcome::Failed;
        }
        if let Err(err) = self.relationships.sync_user_node(profile.user_id).await {
            warn!(user_id = %profile.user_id, error = %err, "User node sync failed");
            return HandleOutcome::Failed;
        }

        debug!(user_id = %profile.user_id, "Profile replica updated");
        HandleOutcome::Handled
    }
}

fn decode<T: serde::de::DeserializeOwned>(record: &StreamRecord) -> Option<T> {
    match serde_json::from_slice(&record.payload) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(
                topic = record.topic.as_str(),
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "Skipping undecodable event"
            );
            None
        }
    }
}

pub struct EventIngestor {
    handlers: Arc<EventHandlers>,
    config: IngestConfig,
}

/// Join handles of running consumer loops.
pub struct IngestHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl IngestHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every loop to exit.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "Event consumer task panicked");
            }
        }
    }
}

impl EventIngestor {
    pub fn new(handlers: Arc<EventHandlers>, config: IngestConfig) -> Self {
        Self { handlers, config }
    }

    /// Start one loop per stream. Each loop exits once `shutdown` flips to
    /// `true` or its sender is dropped, after finishing the record in hand.
    pub fn spawn(
        &self,
        streams: Vec<Arc<dyn EventStream>>,
        shutdown: watch::Receiver<bool>,
    ) -> IngestHandle {
        let tasks = streams
            .into_iter()
            .map(|stream| {
                let handlers = self.handlers.clone();
                let config = self.config.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(consume(stream, handlers, config, shutdown))
            })
            .collect();
        IngestHandle { tasks }
    }
}

async fn consume(
    stream: Arc<dyn EventStream>,
    handlers: Arc<EventHandlers>,
    config: IngestConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = stream.topic();
    let partition = stream.partition();
    info!(topic = topic.as_str(), partition, "Event consumer started");

    'poll: loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = tokio::select! {
            _ = shutdown.changed() => break,
            batch = stream.next_batch(config.batch_size.max(1)) => batch,
        };

        let records = match batch {
            Ok(records) if records.is_empty() => {
                idle(config.poll_interval, &mut shutdown).await;
                continue;
            }
            Ok(records) => records,
            Err(err) => {
                warn!(
                    topic = topic.as_str(),
                    partition,
                    error = %err,
                    "Event stream read failed"
                );
                idle(config.poll_interval, &mut shutdown).await;
                continue;
            }
        };

        for record in records {
            if *shutdown.borrow() {
                break 'poll;
            }

            let outcome = handlers.handle(&record).await;
            debug!(
                topic = topic.as_str(),
                partition,
                offset = record.offset,
                outcome = outcome.as_str(),
                "Event processed"
            );

            if let Err(err) = stream.commit(&record).await {
                warn!(
                    topic = topic.as_str(),
                    partition,
                    offset = record.offset,
                    error = %err,
                    "Offset commit failed"
                );
            }
        }
    }

    info!(topic = topic.as_str(), partition, "Event consumer stopped");
}

async fn idle(interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(interval) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::application::fanout::FanoutConfig;
    use crate::application::repos::{ContentRepo, FeedCandidateFilter, PageWindow, RepoError};
    use crate::application::stream::StreamError;
    use crate::cache::{MemoryTimelineCache, TimelineCacheConfig};
    use crate::domain::entities::ContentItem;
    use crate::domain::types::{ContentId, RelationshipStatus, UserId};

    #[derive(Default)]
    struct Recorder {
        edges: Mutex<Vec<(UserId, UserId, RelationshipStatus)>>,
        nodes: Mutex<Vec<UserId>>,
        profiles: Mutex<Vec<AuthorProfile>>,
    }

    #[async_trait]
    impl RelationshipRepo for Recorder {
        async fn friend_ids(&self, _user: UserId) -> Result<Vec<UserId>, RepoError> {
            Ok(Vec::new())
        }

        async fn upsert_or_remove_edge(
            &self,
            user_a: UserId,
            user_b: UserId,
            status: RelationshipStatus,
        ) -> Result<(), RepoError> {
            self.edges
                .lock()
                .expect("edges")
                .push((user_a, user_b, status));
            Ok(())
        }

        async fn sync_user_node(&self, user: UserId) -> Result<(), RepoError> {
            self.nodes.lock().expect("nodes").push(user);
            Ok(())
        }
    }

    #[async_trait]
    impl ProfileRepo for Recorder {
        async fn upsert_profile(&self, profile: &AuthorProfile) -> Result<(), RepoError> {
            self.profiles.lock().expect("profiles").push(profile.clone());
            Ok(())
        }

        async fn find_profile(&self, _user: UserId) -> Result<Option<AuthorProfile>, RepoError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl ContentRepo for Recorder {
        async fn find_by_id(&self, _id: ContentId) -> Result<Option<ContentItem>, RepoError> {
            Ok(None)
        }

        async fn query_feed_candidates(
            &self,
            _filter: &FeedCandidateFilter,
            _window: PageWindow,
        ) -> Result<Vec<ContentItem>, RepoError> {
            Ok(Vec::new())
        }
    }

    /// A fixed queue of records; commits are recorded.
    struct ScriptedStream {
        topic: Topic,
        pending: Mutex<Vec<StreamRecord>>,
        committed: Mutex<Vec<i64>>,
    }

    impl ScriptedStream {
        fn new(topic: Topic, payloads: &[&str]) -> Self {
            let pending = payloads
                .iter()
                .enumerate()
                .map(|(offset, payload)| StreamRecord {
                    topic,
                    partition: 0,
                    offset: offset as i64,
                    payload: Bytes::copy_from_slice(payload.as_bytes()),
                })
                .collect();
            Self {
                topic,
                pending: Mutex::new(pending),
                committed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventStream for ScriptedStream {
        fn topic(&self) -> Topic {
            self.topic
        }

        fn partition(&self) -> u32 {
            0
        }

        async fn next_batch(&self, max: usize) -> Result<Vec<StreamRecord>, StreamError> {
            let mut pending = self.pending.lock().expect("pending");
            let take = max.min(pending.len());
            Ok(pending.drain(..take).collect())
        }

        async fn commit(&self, record: &StreamRecord) -> Result<(), StreamError> {
            self.committed.lock().expect("committed").push(record.offset);
            Ok(())
        }
    }

    fn handlers(cache: Arc<MemoryTimelineCache>, recorder: Arc<Recorder>) -> Arc<EventHandlers> {
        let fanout = FanoutWriter::new(
            cache.clone(),
            recorder.clone(),
            recorder.clone(),
            FanoutConfig::default(),
        );
        Arc::new(EventHandlers::new(
            fanout,
            cache,
            recorder.clone(),
            recorder,
        ))
    }

    fn record(topic: Topic, payload: &str) -> StreamRecord {
        StreamRecord {
            topic,
            partition: 0,
            offset: 0,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let handlers = handlers(
            Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::default())),
            Arc::new(Recorder::default()),
        );

        for topic in Topic::ALL {
            assert_eq!(
                handlers.handle(&record(topic, "{\"unexpected\":true}")).await,
                HandleOutcome::Skipped
            );
        }
    }

    #[tokio::test]
    async fn self_relationship_is_skipped() {
        let recorder = Arc::new(Recorder::default());
        let handlers = handlers(
            Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::default())),
            recorder.clone(),
        );
        let id = Uuid::from_u128(4);

        let outcome = handlers
            .handle(&record(
                Topic::Relationship,
                &format!(r#"{{"user_a":"{id}","user_b":"{id}","status":"accepted"}}"#),
            ))
            .await;

        assert_eq!(outcome, HandleOutcome::Skipped);
        assert!(recorder.edges.lock().expect("edges").is_empty());
    }

    #[tokio::test]
    async fn profile_event_updates_replica_and_node() {
        let recorder = Arc::new(Recorder::default());
        let handlers = handlers(
            Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::default())),
            recorder.clone(),
        );
        let id = Uuid::from_u128(9);

        let outcome = handlers
            .handle(&record(
                Topic::Profile,
                &format!(
                    r#"{{"user_id":"{id}","display_name":"Grace","updated_at":"2025-06-01T12:00:00Z"}}"#
                ),
            ))
            .await;

        assert_eq!(outcome, HandleOutcome::Handled);
        let profiles = recorder.profiles.lock().expect("profiles");
        assert_eq!(profiles[0].display_name, "Grace");
        assert_eq!(profiles[0].updated_at, datetime!(2025-06-01 12:00 UTC));
        drop(profiles);
        assert_eq!(*recorder.nodes.lock().expect("nodes"), vec![UserId(id)]);
    }

    #[tokio::test]
    async fn consumer_commits_every_record_and_stops_on_shutdown() {
        let cache = Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::default()));
        let recorder = Arc::new(Recorder::default());
        let author = Uuid::from_u128(1);
        let content = Uuid::from_u128(2);
        let stream = Arc::new(ScriptedStream::new(
            Topic::Content,
            &[
                "not json",
                &format!(
                    r#"{{"type":"created","content_id":"{content}","author_id":"{author}","privacy":"public","created_at":"2025-06-01T12:00:00Z"}}"#
                ),
            ],
        ));

        let ingestor = EventIngestor::new(
            handlers(cache.clone(), recorder),
            IngestConfig {
                poll_interval: Duration::from_millis(5),
                batch_size: 10,
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ingestor.spawn(vec![stream.clone()], shutdown_rx);
        assert_eq!(handle.len(), 1);

        for _ in 0..200 {
            if stream.committed.lock().expect("committed").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).expect("send shutdown");
        handle.join().await;

        assert_eq!(*stream.committed.lock().expect("committed"), vec![0, 1]);
        assert_eq!(
            cache.timelines().range_slice(UserId(author), 0, 10),
            vec![ContentId(content)]
        );
    }
}
