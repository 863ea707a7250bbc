use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bluetrace::{
    AppState,
    cache::{CounterStore, RedisCounterStore},
    config::Config,
    database::{PgPlanResolver, PgRecordStore, RecordStore, schema},
    ingest::{HttpSourceClient, IngestContext, datasets},
    middleware::{AdminToken, Admission},
    rate_limit::RateLimiter,
    router::build_router,
    scheduler::Scheduler,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().expect("Failed to load configuration");
    let mut plans: Vec<&str> = config.plans.names().collect();
    plans.sort_unstable();
    tracing::info!("Rate limit plans: {}", plans.join(", "));

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'bluetrace_api';").await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");
    schema::ensure_schema(&pool)
        .await
        .expect("Failed to prepare database schema");
    let pool = Arc::new(pool);

    // Connections are opened lazily, so the API starts while Redis is down.
    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let counters: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(redis_client));
    let records: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(Arc::clone(&pool)));

    let limiter = RateLimiter::new(
        Arc::clone(&counters),
        config.rate_limit_sub_buckets,
        config.counter_store_timeout(),
    );
    let resolver = Arc::new(PgPlanResolver::new(Arc::clone(&pool), config.plans.clone()));
    let admission = Arc::new(Admission::new(limiter, resolver, config.api_key_salt.clone()));

    let source = Arc::new(HttpSourceClient::new().expect("Failed to build HTTP client"));
    let ctx = IngestContext::new(
        Arc::clone(&records),
        config.ingest.retry,
        config.ingest.fetch_timeout,
    );
    let mut scheduler = Scheduler::new(ctx, config.ingest.max_concurrency);
    for ingester in datasets::build_registry(&config.ingest, source) {
        let interval = config.ingest.interval(ingester.dataset());
        scheduler.register(ingester, interval);
    }
    let scheduler = Arc::new(scheduler);
    let tickers = scheduler.start();

    let state = AppState {
        records,
        counters,
        scheduler: Arc::clone(&scheduler),
    };
    let app = build_router(state, admission, AdminToken::new(config.admin_token.clone()));

    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");

    scheduler.shutdown();
    if !scheduler.drain(DRAIN_DEADLINE).await {
        tracing::warn!("Ingestion jobs still running after {:?}", DRAIN_DEADLINE);
    }
    for ticker in tickers {
        ticker.abort();
    }
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
