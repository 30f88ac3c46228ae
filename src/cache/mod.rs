//! Murmur timeline cache.
//!
//! Two structures per user:
//!
//! - **Timeline lists**: bounded, most-recent-first content ids, written by fan-out
//! - **Snapshots**: serialized content items with expiry, written on write-through
//!   and read-path reconciliation
//!
//! ## Configuration
//!
//! ```toml
//! [timeline]
//! capacity = 500
//! timeline_ttl_seconds = 604800
//! snapshot_ttl_seconds = 3600
//! snapshot_limit = 50000
//! sweep_interval_seconds = 60
//! ```

mod backend;
mod config;
mod keys;
pub(crate) mod lock;
mod snapshot;
mod timeline;

pub use backend::{CacheError, MemoryTimelineCache, TimelineCache};
pub use config::TimelineCacheConfig;
pub use keys::{CacheNamespace, SnapshotKey, TimelineKey};
pub use snapshot::{SnapshotBatch, SnapshotStore};
pub use timeline::{PushOutcome, TimelineStore};
