//! Timeline cache configuration.
//!
//! Resolved from the `[timeline]` section of `murmur.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TIMELINE_CAPACITY: usize = 500;
const DEFAULT_TIMELINE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_SNAPSHOT_TTL_SECS: u64 = 60 * 60;
const DEFAULT_SNAPSHOT_LIMIT: usize = 50_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimelineCacheConfig {
    /// Maximum ids kept per user timeline (the bound N).
    pub timeline_capacity: usize,
    /// Idle lifetime of a timeline list; zero keeps lists until trimmed.
    pub timeline_ttl_secs: u64,
    /// Lifetime of a content snapshot.
    pub snapshot_ttl_secs: u64,
    /// Maximum snapshots held before LRU eviction.
    pub snapshot_limit: usize,
}

impl Default for TimelineCacheConfig {
    fn default() -> Self {
        Self {
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
            timeline_ttl_secs: DEFAULT_TIMELINE_TTL_SECS,
            snapshot_ttl_secs: DEFAULT_SNAPSHOT_TTL_SECS,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
        }
    }
}

impl From<&crate::config::TimelineSettings> for TimelineCacheConfig {
    fn from(settings: &crate::config::TimelineSettings) -> Self {
        Self {
            timeline_capacity: settings.capacity.get(),
            timeline_ttl_secs: settings.timeline_ttl.as_secs(),
            snapshot_ttl_secs: settings.snapshot_ttl.as_secs(),
            snapshot_limit: settings.snapshot_limit.get(),
        }
    }
}

impl TimelineCacheConfig {
    /// Timeline bound, clamped to 1 if zero.
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.timeline_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn timeline_ttl(&self) -> Option<Duration> {
        (self.timeline_ttl_secs > 0).then(|| Duration::from_secs(self.timeline_ttl_secs))
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    /// Snapshot capacity, clamped to 1 if zero.
    pub fn snapshot_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.snapshot_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
