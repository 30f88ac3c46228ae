use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber and describe the crate's metrics.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(logging.with_target)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(logging.with_target)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Histogram,
}

/// Every metric the crate records: kind, name, unit, description.
const METRICS: &[(MetricKind, &str, Unit, &str)] = &[
    (
        MetricKind::Counter,
        "murmur_timeline_trimmed_total",
        Unit::Count,
        "Ids dropped from timeline tails by push-and-trim.",
    ),
    (
        MetricKind::Counter,
        "murmur_timeline_expired_total",
        Unit::Count,
        "Idle timeline lists dropped after their TTL.",
    ),
    (
        MetricKind::Counter,
        "murmur_snapshot_hit_total",
        Unit::Count,
        "Content snapshot hits.",
    ),
    (
        MetricKind::Counter,
        "murmur_snapshot_miss_total",
        Unit::Count,
        "Content snapshot misses, including expired entries.",
    ),
    (
        MetricKind::Counter,
        "murmur_snapshot_evict_total",
        Unit::Count,
        "Content snapshots evicted due to capacity.",
    ),
    (
        MetricKind::Counter,
        "murmur_fanout_recipients_total",
        Unit::Count,
        "Timeline pushes delivered by fan-out.",
    ),
    (
        MetricKind::Counter,
        "murmur_fanout_failed_total",
        Unit::Count,
        "Timeline pushes that failed during fan-out.",
    ),
    (
        MetricKind::Histogram,
        "murmur_fanout_ms",
        Unit::Milliseconds,
        "Fan-out latency per content item in milliseconds.",
    ),
    (
        MetricKind::Counter,
        "murmur_feed_reads_total",
        Unit::Count,
        "Feed pages served, labelled by source.",
    ),
    (
        MetricKind::Counter,
        "murmur_feed_backfill_total",
        Unit::Count,
        "Snapshot misses fetched one by one from the primary store.",
    ),
    (
        MetricKind::Counter,
        "murmur_feed_dropped_total",
        Unit::Count,
        "Timeline ids left out of a page as unfetchable or archived.",
    ),
    (
        MetricKind::Counter,
        "murmur_ingest_events_total",
        Unit::Count,
        "Stream records handled, labelled by topic.",
    ),
    (
        MetricKind::Counter,
        "murmur_ingest_skipped_total",
        Unit::Count,
        "Undecodable or invalid stream records skipped.",
    ),
    (
        MetricKind::Counter,
        "murmur_ingest_failed_total",
        Unit::Count,
        "Stream records whose handler gave up.",
    ),
];

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (kind, name, unit, description) in METRICS {
            match kind {
                MetricKind::Counter => describe_counter!(*name, *unit, *description),
                MetricKind::Histogram => describe_histogram!(*name, *unit, *description),
            }
        }
    });
}
