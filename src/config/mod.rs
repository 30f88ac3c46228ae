//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "murmur";
const ENV_PREFIX: &str = "MURMUR";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_TIMELINE_CAPACITY: u64 = 500;
const DEFAULT_TIMELINE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_SNAPSHOT_TTL_SECS: u64 = 60 * 60;
const DEFAULT_SNAPSHOT_LIMIT: u64 = 50_000;
const DEFAULT_TIMELINE_SWEEP_INTERVAL_SECS: u64 = 60;
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_FANOUT_CONCURRENCY: u64 = 1;
const DEFAULT_FEED_PAGE_SIZE: u64 = 20;
const DEFAULT_FEED_MAX_PAGE_SIZE: u64 = 100;
const DEFAULT_FEED_BACKFILL_CONCURRENCY: u64 = 8;
const DEFAULT_INGEST_PARTITIONS: u64 = 4;
const DEFAULT_INGEST_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_INGEST_BATCH_SIZE: u64 = 64;
const DEFAULT_CONSUMER_GROUP: &str = "murmur-feed";

/// Command-line arguments for the murmur binary.
#[derive(Debug, Parser)]
#[command(name = "murmur", version, about = "Social feed fan-out and timeline cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MURMUR_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Consume the event log, keep timelines current and serve feed reads over HTTP.
    Serve(Box<ServeArgs>),
    /// Read one feed page from the store (cold cache) and print it as JSON.
    Feed(FeedArgs),
    /// Run the friends scenario against in-memory stores and print each page.
    Demo(DemoArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the feed endpoint's listen address.
    #[arg(long = "listen-addr", value_name = "ADDR")]
    pub listen_addr: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the per-user timeline bound.
    #[arg(long = "timeline-capacity", value_name = "COUNT")]
    pub timeline_capacity: Option<u64>,

    /// Override the number of recipient pushes in flight per event.
    #[arg(long = "fanout-concurrency", value_name = "COUNT")]
    pub fanout_concurrency: Option<u64>,

    /// Toggle snapshot write-through after fan-out.
    #[arg(
        long = "fanout-write-through",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub fanout_write_through: Option<bool>,

    /// Override the number of partitions per topic.
    #[arg(long = "ingest-partitions", value_name = "COUNT")]
    pub ingest_partitions: Option<u64>,

    /// Override the idle poll interval.
    #[arg(long = "ingest-poll-interval-ms", value_name = "MILLIS")]
    pub ingest_poll_interval_ms: Option<u64>,

    /// Override the consumer group whose offsets are tracked.
    #[arg(long = "ingest-consumer-group", value_name = "NAME")]
    pub ingest_consumer_group: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FeedArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Viewer whose feed is read.
    #[arg(long = "viewer", value_name = "UUID")]
    pub viewer: Uuid,

    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Page size; defaults to `feed.default_page_size`.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<usize>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the number of recipient pushes in flight per event.
    #[arg(long = "fanout-concurrency", value_name = "COUNT")]
    pub fanout_concurrency: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub timeline: TimelineSettings,
    pub fanout: FanoutSettings,
    pub feed: FeedSettings,
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
    pub with_target: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct TimelineSettings {
    pub capacity: NonZeroUsize,
    /// Zero disables idle expiry.
    pub timeline_ttl: Duration,
    pub snapshot_ttl: Duration,
    pub snapshot_limit: NonZeroUsize,
    /// How often expired timeline lists are swept from memory.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FanoutSettings {
    pub concurrency: NonZeroUsize,
    pub write_through: bool,
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub default_page_size: NonZeroUsize,
    pub max_page_size: NonZeroUsize,
    pub backfill_concurrency: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub partitions: NonZeroU32,
    pub poll_interval: Duration,
    pub batch_size: NonZeroUsize,
    pub consumer_group: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Feed(args)) => {
            raw.apply_logging_overrides(&args.logging);
            raw.apply_database_override(&args.database);
        }
        Some(Command::Demo(args)) => {
            raw.apply_logging_overrides(&args.logging);
            if let Some(value) = args.fanout_concurrency {
                raw.fanout.concurrency = Some(value);
            }
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    server: RawServerSettings,
    database: RawDatabaseSettings,
    timeline: RawTimelineSettings,
    fanout: RawFanoutSettings,
    feed: RawFeedSettings,
    ingest: RawIngestSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_database_override(&overrides.database);

        if let Some(addr) = overrides.listen_addr.as_ref() {
            self.server.listen_addr = Some(addr.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(capacity) = overrides.timeline_capacity {
            self.timeline.capacity = Some(capacity);
        }
        if let Some(value) = overrides.fanout_concurrency {
            self.fanout.concurrency = Some(value);
        }
        if let Some(value) = overrides.fanout_write_through {
            self.fanout.write_through = Some(value);
        }
        if let Some(value) = overrides.ingest_partitions {
            self.ingest.partitions = Some(value);
        }
        if let Some(value) = overrides.ingest_poll_interval_ms {
            self.ingest.poll_interval_ms = Some(value);
        }
        if let Some(group) = overrides.ingest_consumer_group.as_ref() {
            self.ingest.consumer_group = Some(group.clone());
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            server,
            database,
            timeline,
            fanout,
            feed,
            ingest,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            server: build_server_settings(server)?,
            database: build_database_settings(database)?,
            timeline: build_timeline_settings(timeline)?,
            fanout: build_fanout_settings(fanout)?,
            feed: build_feed_settings(feed)?,
            ingest: build_ingest_settings(ingest)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings {
        level,
        format,
        with_target: logging.with_target.unwrap_or(true),
    })
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let raw = server
        .listen_addr
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let listen_addr = SocketAddr::from_str(raw.trim()).map_err(|err| {
        LoadError::invalid("server.listen_addr", format!("failed to parse: {err}"))
    })?;
    Ok(ServerSettings { listen_addr })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_timeline_settings(timeline: RawTimelineSettings) -> Result<TimelineSettings, LoadError> {
    let capacity = non_zero_usize(
        timeline.capacity.unwrap_or(DEFAULT_TIMELINE_CAPACITY),
        "timeline.capacity",
    )?;

    let snapshot_ttl_secs = bounded_ttl(
        timeline
            .snapshot_ttl_seconds
            .unwrap_or(DEFAULT_SNAPSHOT_TTL_SECS),
        "timeline.snapshot_ttl_seconds",
    )?;
    if snapshot_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "timeline.snapshot_ttl_seconds",
            "must be greater than zero",
        ));
    }
    let timeline_ttl_secs = bounded_ttl(
        timeline
            .timeline_ttl_seconds
            .unwrap_or(DEFAULT_TIMELINE_TTL_SECS),
        "timeline.timeline_ttl_seconds",
    )?;

    let sweep_secs = timeline
        .sweep_interval_seconds
        .unwrap_or(DEFAULT_TIMELINE_SWEEP_INTERVAL_SECS);
    if sweep_secs == 0 {
        return Err(LoadError::invalid(
            "timeline.sweep_interval_seconds",
            "must be greater than zero",
        ));
    }

    let snapshot_limit = non_zero_usize(
        timeline.snapshot_limit.unwrap_or(DEFAULT_SNAPSHOT_LIMIT),
        "timeline.snapshot_limit",
    )?;

    Ok(TimelineSettings {
        capacity,
        timeline_ttl: Duration::from_secs(timeline_ttl_secs),
        snapshot_ttl: Duration::from_secs(snapshot_ttl_secs),
        snapshot_limit,
        sweep_interval: Duration::from_secs(sweep_secs),
    })
}

fn bounded_ttl(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value > MAX_TTL_SECS {
        return Err(LoadError::invalid(
            key,
            format!("must not exceed {MAX_TTL_SECS} seconds"),
        ));
    }
    Ok(value)
}

fn build_fanout_settings(fanout: RawFanoutSettings) -> Result<FanoutSettings, LoadError> {
    Ok(FanoutSettings {
        concurrency: non_zero_usize(
            fanout.concurrency.unwrap_or(DEFAULT_FANOUT_CONCURRENCY),
            "fanout.concurrency",
        )?,
        write_through: fanout.write_through.unwrap_or(true),
    })
}

fn build_feed_settings(feed: RawFeedSettings) -> Result<FeedSettings, LoadError> {
    let default_page_size = non_zero_usize(
        feed.default_page_size.unwrap_or(DEFAULT_FEED_PAGE_SIZE),
        "feed.default_page_size",
    )?;
    let max_page_size = non_zero_usize(
        feed.max_page_size.unwrap_or(DEFAULT_FEED_MAX_PAGE_SIZE),
        "feed.max_page_size",
    )?;
    if default_page_size > max_page_size {
        return Err(LoadError::invalid(
            "feed.default_page_size",
            "must not exceed feed.max_page_size",
        ));
    }

    Ok(FeedSettings {
        default_page_size,
        max_page_size,
        backfill_concurrency: non_zero_usize(
            feed.backfill_concurrency
                .unwrap_or(DEFAULT_FEED_BACKFILL_CONCURRENCY),
            "feed.backfill_concurrency",
        )?,
    })
}

fn build_ingest_settings(ingest: RawIngestSettings) -> Result<IngestSettings, LoadError> {
    let partitions = non_zero_u32(
        ingest.partitions.unwrap_or(DEFAULT_INGEST_PARTITIONS),
        "ingest.partitions",
    )?;

    let poll_interval_ms = ingest
        .poll_interval_ms
        .unwrap_or(DEFAULT_INGEST_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        return Err(LoadError::invalid(
            "ingest.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    let batch_size = non_zero_usize(
        ingest.batch_size.unwrap_or(DEFAULT_INGEST_BATCH_SIZE),
        "ingest.batch_size",
    )?;

    let consumer_group = ingest
        .consumer_group
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
    if consumer_group.is_empty() {
        return Err(LoadError::invalid(
            "ingest.consumer_group",
            "must not be empty",
        ));
    }

    Ok(IngestSettings {
        partitions,
        poll_interval: Duration::from_millis(poll_interval_ms),
        batch_size,
        consumer_group,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
    with_target: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTimelineSettings {
    capacity: Option<u64>,
    timeline_ttl_seconds: Option<u64>,
    snapshot_ttl_seconds: Option<u64>,
    snapshot_limit: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFanoutSettings {
    concurrency: Option<u64>,
    write_through: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFeedSettings {
    default_page_size: Option<u64>,
    max_page_size: Option<u64>,
    backfill_concurrency: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIngestSettings {
    partitions: Option<u64>,
    poll_interval_ms: Option<u64>,
    batch_size: Option<u64>,
    consumer_group: Option<String>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
