//! Fan-out writer: pushes a newly created content id into every recipient's
//! timeline.
//!
//! Writes are fan-and-forget. A failed recipient is recorded in the
//! [`FanoutReport`] and never retried here; the feed reader's fallback path
//! repairs whatever the writer missed.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::repos::{ContentRepo, RelationshipRepo, RepoError};
use crate::cache::{CacheError, TimelineCache, TimelineCacheConfig};
use crate::domain::error::DomainError;
use crate::domain::events::ContentCreated;
use crate::domain::types::{ContentId, Privacy, UserId};

const METRIC_FANOUT_DELIVERED: &str = "murmur_fanout_recipients_total";
const METRIC_FANOUT_FAILED: &str = "murmur_fanout_failed_total";
const METRIC_FANOUT_MS: &str = "murmur_fanout_ms";

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Timeline bound applied on every push.
    pub capacity: NonZeroUsize,
    /// Recipient pushes in flight at once; 1 keeps the writer sequential.
    pub concurrency: NonZeroUsize,
    /// Store a snapshot of the new item after the pushes.
    pub write_through: bool,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            capacity: TimelineCacheConfig::default().capacity(),
            concurrency: NonZeroUsize::MIN,
            write_through: true,
        }
    }
}

impl From<&crate::config::Settings> for FanoutConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            capacity: settings.timeline.capacity,
            concurrency: settings.fanout.concurrency,
            write_through: settings.fanout.write_through,
        }
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    InvalidEvent(#[from] DomainError),
    #[error("failed to resolve recipients of `{author}`: {source}")]
    Recipients {
        author: UserId,
        #[source]
        source: RepoError,
    },
}

#[derive(Debug)]
pub struct RecipientFailure {
    pub recipient: UserId,
    pub error: CacheError,
}

/// Outcome of one fan-out, logged once by the caller.
#[derive(Debug)]
pub struct FanoutReport {
    pub content_id: ContentId,
    pub recipients: usize,
    pub delivered: usize,
    pub failures: Vec<RecipientFailure>,
    pub snapshot_written: bool,
}

impl FanoutReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct FanoutWriter {
    cache: Arc<dyn TimelineCache>,
    relationships: Arc<dyn RelationshipRepo>,
    content: Arc<dyn ContentRepo>,
    config: FanoutConfig,
}

impl FanoutWriter {
    pub fn new(
        cache: Arc<dyn TimelineCache>,
        relationships: Arc<dyn RelationshipRepo>,
        content: Arc<dyn ContentRepo>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            cache,
            relationships,
            content,
            config,
        }
    }

    /// The author first, then each current friend once. Self-only content
    /// reaches only the author.
    pub async fn resolve_recipients(
        &self,
        event: &ContentCreated,
    ) -> Result<Vec<UserId>, FanoutError> {
        let author = event.author_id;
        if event.privacy == Privacy::SelfOnly {
            return Ok(vec![author]);
        }

        let friends = self
            .relationships
            .friend_ids(author)
            .await
            .map_err(|source| FanoutError::Recipients { author, source })?;

        let mut seen = HashSet::with_capacity(friends.len() + 1);
        seen.insert(author);
        let mut recipients = Vec::with_capacity(friends.len() + 1);
        recipients.push(author);
        recipients.extend(friends.into_iter().filter(|friend| seen.insert(*friend)));
        Ok(recipients)
    }

    pub async fn fan_out(&self, event: &ContentCreated) -> Result<FanoutReport, FanoutError> {
        event.validate()?;
        let started = Instant::now();
        let recipients = self.resolve_recipients(event).await?;
        let total = recipients.len();

        let cache = &self.cache;
        let content_id = event.content_id;
        let capacity = self.config.capacity;
        let outcomes: Vec<(UserId, Result<usize, CacheError>)> = stream::iter(recipients)
            .map(|recipient| async move {
                let result = cache.push_and_trim(recipient, content_id, capacity).await;
                (recipient, result)
            })
            .buffer_unordered(self.config.concurrency.get())
            .collect()
            .await;

        let mut delivered = 0;
        let mut failures = Vec::new();
        for (recipient, result) in outcomes {
            match result {
                Ok(len) => {
                    delivered += 1;
                    debug!(%content_id, %recipient, len, "Timeline entry pushed");
                }
                Err(error) => failures.push(RecipientFailure { recipient, error }),
            }
        }

        counter!(METRIC_FANOUT_DELIVERED).increment(delivered as u64);
        if !failures.is_empty() {
            counter!(METRIC_FANOUT_FAILED).increment(failures.len() as u64);
        }

        let snapshot_written = self.config.write_through && self.write_snapshot(content_id).await;

        histogram!(METRIC_FANOUT_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        Ok(FanoutReport {
            content_id,
            recipients: total,
            delivered,
            failures,
            snapshot_written,
        })
    }

    async fn write_snapshot(&self, content_id: ContentId) -> bool {
        let item = match self.content.find_by_id(content_id).await {
            Ok(Some(item)) if item.is_active() => item,
            Ok(_) => {
                debug!(%content_id, "Skipping snapshot for missing or archived content");
                return false;
            }
            Err(err) => {
                warn!(%content_id, error = %err, "Failed to load content for snapshot");
                return false;
            }
        };

        match self.cache.set_snapshot(&item).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%content_id, error = %err, "Failed to write content snapshot");
                false
            }
        }
    }
}
