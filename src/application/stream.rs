//! Partitioned event stream abstraction consumed by the ingestor.
//!
//! Delivery is at-least-once: a record is committed only after its handler
//! returns, and a consumer restarted after a crash resumes from the last
//! committed offset.

use std::num::NonZeroU32;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::domain::events::{ContentEvent, ProfileUpdated, RelationshipChanged, Topic};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event stream unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode `{topic}` event: {source}")]
    Encode {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },
}

impl StreamError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub topic: Topic,
    pub partition: u32,
    pub offset: i64,
    pub payload: Bytes,
}

/// A single (topic, partition) read cursor for one consumer group.
///
/// Implementations must be cancel-safe in `next_batch`: a dropped call must
/// not advance the cursor.
#[async_trait]
pub trait EventStream: Send + Sync {
    fn topic(&self) -> Topic;

    fn partition(&self) -> u32;

    /// Up to `max` records after the cursor, in offset order. Empty when idle.
    async fn next_batch(&self, max: usize) -> Result<Vec<StreamRecord>, StreamError>;

    /// Mark `record` handled for this consumer group.
    async fn commit(&self, record: &StreamRecord) -> Result<(), StreamError>;
}

/// Appends raw payloads to a topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    fn partitions(&self) -> NonZeroU32;

    /// Returns the offset assigned to the appended record.
    async fn append(
        &self,
        topic: Topic,
        partition: u32,
        payload: Bytes,
    ) -> Result<i64, StreamError>;
}

/// An event contract that knows its topic and routing key.
pub trait StreamEvent: Serialize + Sync {
    const TOPIC: Topic;

    fn routing_key(&self) -> u128;
}

impl StreamEvent for ContentEvent {
    const TOPIC: Topic = Topic::Content;

    fn routing_key(&self) -> u128 {
        match self.partition_key() {
            Some(author) => author.0.as_u128(),
            None => self.content_id().0.as_u128(),
        }
    }
}

impl StreamEvent for RelationshipChanged {
    const TOPIC: Topic = Topic::Relationship;

    fn routing_key(&self) -> u128 {
        let (low, high) = self.pair();
        low.0.as_u128() ^ high.0.as_u128().rotate_left(64)
    }
}

impl StreamEvent for ProfileUpdated {
    const TOPIC: Topic = Topic::Profile;

    fn routing_key(&self) -> u128 {
        self.user_id.0.as_u128()
    }
}

pub fn partition_for(key: u128, partitions: NonZeroU32) -> u32 {
    (key % u128::from(partitions.get())) as u32
}

/// Encode `event` and append it to the partition its routing key selects.
pub async fn publish<P, E>(publisher: &P, event: &E) -> Result<i64, StreamError>
where
    P: EventPublisher + ?Sized,
    E: StreamEvent,
{
    let payload = serde_json::to_vec(event).map_err(|source| StreamError::Encode {
        topic: E::TOPIC,
        source,
    })?;
    let partition = partition_for(event.routing_key(), publisher.partitions());
    publisher
        .append(E::TOPIC, partition, Bytes::from(payload))
        .await
}
