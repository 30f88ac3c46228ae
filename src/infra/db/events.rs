//! Partitioned event log stored in Postgres.
//!
//! `feed_events` is an append-only log keyed by (topic, partition, offset).
//! Consumer groups track their position in `stream_offsets`; the stored value
//! is the last handled offset.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    application::stream::{EventPublisher, EventStream, StreamError, StreamRecord},
    cache::lock::mutex_lock,
    domain::events::Topic,
};

use super::{PostgresRepositories, util::map_stream_error};

const SOURCE: &str = "infra::db::events";

#[derive(Clone)]
pub struct PgEventLog {
    repositories: PostgresRepositories,
    partitions: NonZeroU32,
}

impl PgEventLog {
    pub fn new(repositories: PostgresRepositories, partitions: NonZeroU32) -> Self {
        Self {
            repositories,
            partitions,
        }
    }

    /// One stream per (topic, partition), positioned after the group's last
    /// committed offset.
    pub async fn open_streams(
        &self,
        consumer_group: &str,
    ) -> Result<Vec<Arc<dyn EventStream>>, StreamError> {
        let mut streams: Vec<Arc<dyn EventStream>> = Vec::new();
        for topic in Topic::ALL {
            for partition in 0..self.partitions.get() {
                let committed: Option<(i64,)> = sqlx::query_as(
                    r#"
                    SELECT committed_offset
                    FROM stream_offsets
                    WHERE consumer_group = $1 AND topic = $2 AND partition = $3
                    "#,
                )
                .bind(consumer_group)
                .bind(topic.as_str())
                .bind(partition_param(partition)?)
                .fetch_optional(self.repositories.pool())
                .await
                .map_err(map_stream_error)?;

                let next_offset = committed.map(|(offset,)| offset + 1).unwrap_or(0);
                streams.push(Arc::new(PgEventStream {
                    repositories: self.repositories.clone(),
                    consumer_group: consumer_group.to_string(),
                    topic,
                    partition,
                    next_offset: Mutex::new(next_offset),
                }));
            }
        }
        Ok(streams)
    }
}

fn partition_param(partition: u32) -> Result<i32, StreamError> {
    i32::try_from(partition).map_err(|_| StreamError::unavailable("partition out of range"))
}

#[async_trait]
impl EventPublisher for PgEventLog {
    fn partitions(&self) -> NonZeroU32 {
        self.partitions
    }

    async fn append(
        &self,
        topic: Topic,
        partition: u32,
        payload: Bytes,
    ) -> Result<i64, StreamError> {
        let partition = partition_param(partition)?;
        let mut tx = self.repositories.begin().await.map_err(map_stream_error)?;

        // Serializes writers per partition so offsets stay gap-free.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
            .bind(topic.as_str())
            .bind(partition)
            .execute(&mut *tx)
            .await
            .map_err(map_stream_error)?;

        let (offset,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_events (topic, partition, "offset", payload)
            SELECT $1, $2, COALESCE(MAX("offset") + 1, 0), $3
            FROM feed_events
            WHERE topic = $1 AND partition = $2
            RETURNING "offset"
            "#,
        )
        .bind(topic.as_str())
        .bind(partition)
        .bind(payload.as_ref())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_stream_error)?;

        tx.commit().await.map_err(map_stream_error)?;
        Ok(offset)
    }
}

pub struct PgEventStream {
    repositories: PostgresRepositories,
    consumer_group: String,
    topic: Topic,
    partition: u32,
    next_offset: Mutex<i64>,
}

#[async_trait]
impl EventStream for PgEventStream {
    fn topic(&self) -> Topic {
        self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_batch(&self, max: usize) -> Result<Vec<StreamRecord>, StreamError> {
        let from = *mutex_lock(&self.next_offset, SOURCE, "next_batch");
        let limit = i64::try_from(max).unwrap_or(i64::MAX);

        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT "offset", payload
            FROM feed_events
            WHERE topic = $1 AND partition = $2 AND "offset" >= $3
            ORDER BY "offset"
            LIMIT $4
            "#,
        )
        .bind(self.topic.as_str())
        .bind(partition_param(self.partition)?)
        .bind(from)
        .bind(limit)
        .fetch_all(self.repositories.pool())
        .await
        .map_err(map_stream_error)?;

        if let Some((last, _)) = rows.last() {
            *mutex_lock(&self.next_offset, SOURCE, "advance") = last + 1;
        }

        Ok(rows
            .into_iter()
            .map(|(offset, payload)| StreamRecord {
                topic: self.topic,
                partition: self.partition,
                offset,
                payload: Bytes::from(payload),
            })
            .collect())
    }

    async fn commit(&self, record: &StreamRecord) -> Result<(), StreamError> {
        sqlx::query(
            r#"
            INSERT INTO stream_offsets (consumer_group, topic, partition, committed_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (consumer_group, topic, partition) DO UPDATE
            SET committed_offset = GREATEST(stream_offsets.committed_offset, EXCLUDED.committed_offset),
                updated_at = now()
            "#,
        )
        .bind(&self.consumer_group)
        .bind(record.topic.as_str())
        .bind(partition_param(record.partition)?)
        .bind(record.offset)
        .execute(self.repositories.pool())
        .await
        .map_err(map_stream_error)
        .map(|_| ())
    }
}
