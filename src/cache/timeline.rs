//! Bounded per-user timeline lists.
//!
//! Each list is most-recent-first. `push_and_trim` prepends and truncates
//! while holding the entry's shard lock, so concurrent writers to one user
//! never observe (or leave) a list longer than the bound.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;

use crate::domain::types::{ContentId, UserId};

use super::keys::TimelineKey;

const METRIC_TIMELINE_TRIMMED: &str = "murmur_timeline_trimmed_total";
const METRIC_TIMELINE_EXPIRED: &str = "murmur_timeline_expired_total";

#[derive(Debug)]
struct TimelineEntry {
    ids: VecDeque<ContentId>,
    touched_at: Instant,
}

impl TimelineEntry {
    fn new(now: Instant) -> Self {
        Self {
            ids: VecDeque::new(),
            touched_at: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| now.saturating_duration_since(self.touched_at) >= ttl)
    }
}

/// Result of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// List length after the push.
    pub len: usize,
    /// Ids dropped from the tail by this push.
    pub trimmed: usize,
}

/// In-memory store of timeline lists keyed by user.
pub struct TimelineStore {
    entries: DashMap<TimelineKey, TimelineEntry>,
    ttl: Option<Duration>,
}

impl TimelineStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Prepend `id` and keep only the newest `max_len` ids, as one step.
    ///
    /// Not deduplicating: pushing the same id twice stores it twice.
    pub fn push_and_trim(&self, user: UserId, id: ContentId, max_len: NonZeroUsize) -> PushOutcome {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(TimelineKey::from(user))
            .or_insert_with(|| TimelineEntry::new(now));

        if entry.is_expired(now, self.ttl) {
            entry.ids.clear();
            counter!(METRIC_TIMELINE_EXPIRED).increment(1);
        }

        entry.ids.push_front(id);
        let before = entry.ids.len();
        entry.ids.truncate(max_len.get());
        entry.touched_at = now;

        let trimmed = before - entry.ids.len();
        if trimmed > 0 {
            counter!(METRIC_TIMELINE_TRIMMED).increment(trimmed as u64);
        }

        PushOutcome {
            len: entry.ids.len(),
            trimmed,
        }
    }

    /// Ids in list order starting at `offset`. Absent or expired lists are empty.
    pub fn range_slice(&self, user: UserId, offset: usize, limit: usize) -> Vec<ContentId> {
        let key = TimelineKey::from(user);
        let now = Instant::now();

        let expired = match self.entries.get(&key) {
            None => return Vec::new(),
            Some(entry) if entry.is_expired(now, self.ttl) => true,
            Some(entry) => {
                return entry.ids.iter().skip(offset).take(limit).copied().collect();
            }
        };

        if expired
            && self
                .entries
                .remove_if(&key, |_, entry| entry.is_expired(now, self.ttl))
                .is_some()
        {
            counter!(METRIC_TIMELINE_EXPIRED).increment(1);
        }
        Vec::new()
    }

    /// Drop every list idle past the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_expired(now, Some(ttl)));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            counter!(METRIC_TIMELINE_EXPIRED).increment(removed as u64);
        }
        removed
    }

    /// Current list length (zero when absent).
    pub fn len(&self, user: UserId) -> usize {
        self.entries
            .get(&TimelineKey::from(user))
            .map(|entry| entry.ids.len())
            .unwrap_or(0)
    }

    /// Drop a user's list, as if it had expired.
    pub fn evict(&self, user: UserId) -> bool {
        self.entries.remove(&TimelineKey::from(user)).is_some()
    }

    /// Number of users with a materialized list.
    pub fn user_count(&self) -> usize {
        self.entries.len()
    }
}
