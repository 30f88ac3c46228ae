use std::{process, sync::Arc, time::Duration};

use murmur::{
    application::{
        error::AppError,
        fanout::{FanoutConfig, FanoutWriter},
        feed::{FeedConfig, FeedPage, FeedReader, FeedRequest},
        ingest::{EventHandlers, EventIngestor, IngestConfig},
        repos::{ContentRepo, ContentWriteRepo, NewContent, ProfileRepo, RelationshipRepo},
        stream::{EventPublisher, StreamEvent, publish},
    },
    cache::{MemoryTimelineCache, TimelineCache, TimelineCacheConfig},
    config,
    domain::{
        events::{ContentCreated, ContentEvent, ProfileUpdated, RelationshipChanged},
        types::{ContentId, Privacy, RelationshipStatus, UserId},
    },
    infra::{
        db::{PgEventLog, PostgresRepositories},
        error::InfraError,
        http::{FeedHttpState, build_router},
        memory::{MemoryEventBus, MemoryRepositories},
        telemetry,
    },
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const DEMO_CONSUMER_GROUP: &str = "murmur-demo";
const DEMO_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEMO_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Feed(args) => run_feed(settings, args).await,
        config::Command::Demo(_) => run_demo(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let store = Arc::new(repositories.clone());
    let memory_cache = Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::from(
        &settings.timeline,
    )));
    let cache: Arc<dyn TimelineCache> = memory_cache.clone();

    // Reads share the cache the ingestor fills.
    let reader = Arc::new(FeedReader::new(
        cache.clone(),
        store.clone(),
        store.clone(),
        FeedConfig::from(&settings.feed),
    ));
    let router = build_router(FeedHttpState::new(reader, Some(repositories.clone())));

    let handlers = build_handlers(store, cache, &settings);
    let log = PgEventLog::new(repositories, settings.ingest.partitions);
    let streams = log.open_streams(&settings.ingest.consumer_group).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper =
        memory_cache.spawn_sweeper(settings.timeline.sweep_interval, shutdown_rx.clone());
    let ingestor = EventIngestor::new(handlers, IngestConfig::from(&settings.ingest));
    let handle = ingestor.spawn(streams, shutdown_rx.clone());
    info!(
        streams = handle.len(),
        consumer_group = %settings.ingest.consumer_group,
        "Event ingestion started"
    );

    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.listen_addr, "Feed endpoint listening");

    let mut server_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!("Shutdown requested; finishing in-flight events");
    if shutdown_tx.send(true).is_err() {
        warn!("No consumer loop was listening for shutdown");
    }
    handle.join().await;
    info!("Event ingestion stopped");

    if let Err(err) = sweeper.await {
        warn!(error = %err, "Timeline sweeper ended abnormally");
    }
    server
        .await
        .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
    Ok(())
}

async fn run_feed(settings: config::Settings, args: config::FeedArgs) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let store = Arc::new(repositories);
    let cache: Arc<dyn TimelineCache> = Arc::new(MemoryTimelineCache::new(
        &TimelineCacheConfig::from(&settings.timeline),
    ));

    let reader = FeedReader::new(
        cache,
        store.clone(),
        store,
        FeedConfig::from(&settings.feed),
    );
    let request = FeedRequest {
        page: args.page,
        limit: args.limit,
    };
    let page = reader.read(UserId::from(args.viewer), request).await?;
    print_page(None, &page)
}

/// Friends A↔B↔C. B posts publicly, A reads from cache, A and B unfriend,
/// B posts for friends, A's timeline expires and A reads from the store.
async fn run_demo(settings: config::Settings) -> Result<(), AppError> {
    let store = Arc::new(MemoryRepositories::new());
    let memory_cache = Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::from(
        &settings.timeline,
    )));
    let cache: Arc<dyn TimelineCache> = memory_cache.clone();
    let bus = MemoryEventBus::new(settings.ingest.partitions);

    let handlers = build_handlers(store.clone(), cache.clone(), &settings);
    let ingest_config = IngestConfig {
        poll_interval: DEMO_POLL_INTERVAL,
        ..IngestConfig::from(&settings.ingest)
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = EventIngestor::new(handlers, ingest_config)
        .spawn(bus.open_streams(DEMO_CONSUMER_GROUP), shutdown_rx);

    let reader = FeedReader::new(
        cache,
        store.clone(),
        store.clone(),
        FeedConfig::from(&settings.feed),
    );

    let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
    for (user, name) in [(a, "A"), (b, "B"), (c, "C")] {
        emit(
            &bus,
            &ProfileUpdated {
                user_id: user,
                display_name: name.to_string(),
                avatar_url: None,
                updated_at: OffsetDateTime::now_utc(),
            },
        )
        .await?;
    }
    emit(&bus, &friendship(a, b, RelationshipStatus::Accepted)).await?;
    emit(&bus, &friendship(b, c, RelationshipStatus::Accepted)).await?;
    settle(&bus).await?;

    let p1 = create_post(&*store, &bus, b, Privacy::Public, "P1").await?;
    settle(&bus).await?;
    info!(content_id = %p1, "P1 fanned out");

    let page = reader.read(a, FeedRequest::new(1, 10)).await?;
    print_page(Some("A, page 1, after B posts P1"), &page)?;

    emit(&bus, &friendship(a, b, RelationshipStatus::Removed)).await?;
    settle(&bus).await?;

    let p2 = create_post(&*store, &bus, b, Privacy::FriendsOnly, "P2").await?;
    settle(&bus).await?;
    info!(content_id = %p2, "P2 fanned out");

    memory_cache.timelines().evict(a);
    let page = reader.read(a, FeedRequest::new(1, 10)).await?;
    print_page(Some("A, page 1, after unfriending B and timeline expiry"), &page)?;

    let page = reader.read(c, FeedRequest::new(1, 10)).await?;
    print_page(Some("C, page 1"), &page)?;

    if shutdown_tx.send(true).is_err() {
        warn!("No consumer loop was listening for shutdown");
    }
    handle.join().await;
    Ok(())
}

async fn init_repositories(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(PostgresRepositories::new(pool))
}

fn build_handlers<S>(
    store: Arc<S>,
    cache: Arc<dyn TimelineCache>,
    settings: &config::Settings,
) -> Arc<EventHandlers>
where
    S: ContentRepo + RelationshipRepo + ProfileRepo + 'static,
{
    let fanout = FanoutWriter::new(
        cache.clone(),
        store.clone(),
        store.clone(),
        FanoutConfig::from(settings),
    );
    Arc::new(EventHandlers::new(fanout, cache, store.clone(), store))
}

fn friendship(user_a: UserId, user_b: UserId, status: RelationshipStatus) -> RelationshipChanged {
    RelationshipChanged {
        user_a,
        user_b,
        status,
    }
}

async fn emit<E: StreamEvent>(bus: &dyn EventPublisher, event: &E) -> Result<(), AppError> {
    publish(bus, event).await?;
    Ok(())
}

async fn create_post(
    store: &dyn ContentWriteRepo,
    bus: &dyn EventPublisher,
    author: UserId,
    privacy: Privacy,
    body: &str,
) -> Result<ContentId, AppError> {
    let item = store
        .insert_content(NewContent {
            id: ContentId::new(),
            author_id: author,
            privacy,
            body: body.to_string(),
            created_at: OffsetDateTime::now_utc(),
        })
        .await?;

    emit(
        bus,
        &ContentEvent::Created(ContentCreated {
            content_id: item.id,
            author_id: item.author_id,
            privacy: item.privacy,
            created_at: item.created_at,
        }),
    )
    .await?;
    Ok(item.id)
}

/// Wait until the demo consumer group has committed everything published so far.
async fn settle(bus: &MemoryEventBus) -> Result<(), AppError> {
    tokio::time::timeout(DEMO_SETTLE_TIMEOUT, async {
        while bus.pending(DEMO_CONSUMER_GROUP) > 0 {
            tokio::time::sleep(DEMO_POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| AppError::unexpected("demo events were not consumed in time"))
}

fn print_page(label: Option<&str>, page: &FeedPage) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(page)
        .map_err(|err| AppError::unexpected(format!("failed to encode feed page: {err}")))?;
    if let Some(label) = label {
        println!("# {label}");
    }
    println!("{json}");
    Ok(())
}
