use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use tokio::time::interval;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ds_gateway::{
    actors::ActorRegistry,
    broker::ConversationBroker,
    config::GatewayConfig,
    db,
    handlers, health,
    jobs,
    keypackages::KeyPackageService,
    metrics,
    middleware,
    presence::{PresenceHub, PresenceService},
    realtime,
    session::SessionManager,
};

#[derive(Clone, FromRef)]
struct AppState {
    db_pool: db::DbPool,
    actor_registry: Arc<ActorRegistry>,
    session_manager: SessionManager,
    operation_limiter: Arc<middleware::rate_limit::OperationLimiter>,
    conversation_broker: ConversationBroker,
    presence_service: Arc<PresenceService>,
    keypackage_service: KeyPackageService,
    gateway_config: GatewayConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting delivery service gateway");

    let config = GatewayConfig::from_env();

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();

    let db_pool = db::init_db(&db::DbConfig {
        db_path: config.db_path.clone(),
        max_connections: 10,
        acquire_timeout: Duration::from_secs(5),
    })
    .await?;
    tracing::info!("database initialized");

    let actor_registry = Arc::new(ActorRegistry::new(db_pool.clone(), config.gateway_id.clone()));
    let session_manager = SessionManager::new(
        db_pool.clone(),
        config.session_ttl_seconds,
        config.auth_shared_secret.clone(),
    );
    let operation_limiter = Arc::new(middleware::rate_limit::OperationLimiter::new(&config.rate_limits));
    let conversation_broker = ConversationBroker::new(
        db_pool.clone(),
        actor_registry.clone(),
        operation_limiter.clone(),
        &config,
    );
    let presence_hub = Arc::new(PresenceHub::new(256));
    let presence_service = Arc::new(PresenceService::new(
        db_pool.clone(),
        presence_hub,
        config.max_watchlist_size,
        config.max_watchers_per_target,
    ));
    let keypackage_service = KeyPackageService::new(db_pool.clone(), &config);

    let retention_pool = db_pool.clone();
    let retention_config = config.retention.clone();
    tokio::spawn(async move {
        jobs::run_retention_worker(retention_pool, retention_config).await;
    });

    let key_package_pool = db_pool.clone();
    let key_package_sweep_interval = Duration::from_secs(config.retention.sweep_interval_seconds.max(1));
    tokio::spawn(async move {
        jobs::run_key_package_cleanup_worker(key_package_pool, key_package_sweep_interval).await;
    });

    let presence_pool = db_pool.clone();
    tokio::spawn(async move {
        jobs::run_presence_cleanup_worker(presence_pool).await;
    });

    let bucket_limiter = operation_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            bucket_limiter.cleanup_old_buckets(Duration::from_secs(600)).await;
            tracing::debug!("rate limiter bucket cleanup completed");
        }
    });

    let app_state = AppState {
        db_pool: db_pool.clone(),
        actor_registry: actor_registry.clone(),
        session_manager,
        operation_limiter,
        conversation_broker,
        presence_service,
        keypackage_service,
        gateway_config: config.clone(),
    };

    let metrics_router = if config.enable_metrics {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/v1/ws", get(realtime::ws_handler))
        .route("/v1/sse", get(realtime::sse_subscribe))
        .route("/v1/inbox", post(handlers::inbox))
        .route("/v1/presence/lease", post(handlers::lease))
        .route("/v1/presence/renew", post(handlers::renew))
        .route("/v1/presence/watch", post(handlers::watch))
        .route("/v1/presence/unwatch", post(handlers::unwatch))
        .route("/v1/keypackages", post(handlers::publish_keypackages))
        .route("/v1/keypackages/fetch", post(handlers::fetch_keypackages))
        .route("/v1/keypackages/rotate", post(handlers::rotate_keypackages))
        .route("/v1/session/start", post(handlers::session_start))
        .route("/v1/session/resume", post(handlers::session_resume))
        .route("/v1/session/list", get(handlers::list_sessions))
        .route("/v1/session/revoke", post(handlers::revoke))
        .route("/v1/session/logout_all", post(handlers::logout_all))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::logging::log_headers_middleware))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!(%addr, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
