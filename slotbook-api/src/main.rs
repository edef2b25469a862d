use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slotbook_api::{app, worker, AppState, Ports};
use slotbook_booking::dispatch::run_dispatch_loop;
use slotbook_booking::{MockPaymentGateway, NotificationDispatcher};
use slotbook_core::SystemClock;
use slotbook_store::app_config::Config;
use slotbook_store::{
    DbClient, EventProducer, RedisClient, ResilientCache, StoreBookingRepository,
    StoreRefundRepository, StoreSessionRepository,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotbook_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().expect("Failed to load config");
    tracing::info!("Starting Slotbook API on port {}", config.server.port);

    let app_state = bootstrap(&config).await.expect("Failed to initialise services");

    tokio::spawn(worker::start_refund_worker(
        app_state.refunds.clone(),
        Duration::from_secs(config.refunds.poll_interval_seconds.max(1)),
    ));

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

async fn bootstrap(config: &Config) -> anyhow::Result<AppState> {
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to Postgres")?;
    db.migrate().await.context("running migrations")?;

    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("connecting to Redis")?;
    if let Err(e) = redis.ping().await {
        // the resilient cache falls back until Redis answers
        tracing::warn!("Redis not reachable at startup: {}", e);
    }
    let cache = Arc::new(ResilientCache::from_config(Arc::new(redis), &config.cache));

    let producer = EventProducer::new(&config.kafka.brokers, &config.kafka.notification_topic)
        .context("creating Kafka producer")?;
    let (dispatcher, rx) = NotificationDispatcher::channel();
    tokio::spawn(run_dispatch_loop(rx, Arc::new(producer)));

    let bookings = Arc::new(StoreBookingRepository::new(db.pool.clone()));
    let ports = Ports {
        reservations: bookings.clone(),
        meetings: bookings,
        sessions: Arc::new(StoreSessionRepository::new(db.pool.clone())),
        refunds: Arc::new(StoreRefundRepository::new(db.pool.clone())),
        cache,
        gateway: Arc::new(MockPaymentGateway::new(config.gateway.checkout_base_url.clone())),
        clock: Arc::new(SystemClock),
    };

    Ok(AppState::build(ports, config, dispatcher))
}
