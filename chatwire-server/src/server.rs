use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use axum::{
    Extension, Router,
    http::{HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{BusBackend, Config, DatabaseConfig, LogFormat};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    bus::{ChatBus, PgLog},
    db::bootstrap::{self, BootstrapError},
    middleware::{
        identity::IdentityState,
        request_context::{self, RequestIdState},
    },
    routes::{self, docs::create_docs_router},
    services::{
        ChatOrchestrator, FanoutRegistry, HistoryReader,
        directory::{Directories, InMemoryDirectory, PgDirectory},
    },
    tracer,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. Installs the global recorder on first use.
pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|err| {
                    warn!(error = %err, "global metrics recorder unavailable, using a detached one");
                    PrometheusBuilder::new().build_recorder().handle()
                })
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Installs the global tracing subscriber. Returns the configured level.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn initialize_tracing(config: &Config) -> String {
    let fmt_builder = fmt::fmt()
        .with_env_filter(build_env_filter(config))
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    // A subscriber may already be installed by tests or an embedding binary.
    let _ = if matches!(config.logging.format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };

    config.logging.level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates a database connection pool from the given database URL.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(db: &DatabaseConfig) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(db.max_connections));
    Ok(pool)
}

/// Wires the chat services over PostgreSQL when a pool is given, in memory
/// otherwise.
///
/// # Errors
/// Returns [`ServerError::Config`] when the chat settings cannot be applied.
pub fn create_app_state(
    config: &Config,
    pool: Option<sqlx::PgPool>,
) -> Result<Arc<AppState>, ServerError> {
    let (bus, directories) = match pool.as_ref() {
        Some(pool) => (
            ChatBus::new(Arc::new(PgLog::new(pool.clone()))),
            Directories::from_single(Arc::new(PgDirectory::new(pool.clone()))),
        ),
        None => (
            ChatBus::in_memory(),
            Directories::from_single(Arc::new(InMemoryDirectory::with_groups(
                &config.directory.groups,
            ))),
        ),
    };

    let history = HistoryReader::from_config(bus, &config.bus);
    let chat = ChatOrchestrator::from_config(history, directories, &config.chat)
        .map_err(ServerError::Config)?;
    let fanout = Arc::new(FanoutRegistry::new(config.fanout.channel_capacity));

    Ok(Arc::new(AppState::new(chat, fanout, pool)))
}

pub fn create_cors_layer(config: &Config) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]))
        .allow_headers(AllowHeaders::any())
        .allow_credentials(config.server.cors.allow_credentials)
        .max_age(Duration::from_secs(config.server.cors.max_age_seconds));

    if config.server.cors.allowed_origins.is_empty() {
        cors.allow_origin(AllowOrigin::any())
    } else {
        let origins = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect::<Vec<_>>();
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

pub fn create_api_router(config: &Config) -> Router<Arc<AppState>> {
    routes::chat::create_router_chat(IdentityState::from_config(config))
}

/// Builds the full application: API, relay socket, health, metrics and docs.
pub fn create_app_router(
    state: Arc<AppState>,
    config: Arc<Config>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let request_id_state = RequestIdState::from_config(&config);

    Router::new()
        .nest("/api", create_api_router(&config))
        .merge(routes::chat::create_router_ws())
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .merge(create_docs_router())
        .layer(Extension(IdentityState::from_config(&config)))
        .layer(Extension(metrics_handle))
        .layer(create_cors_layer(&config))
        .layer(tracer::create_trace_layer())
        .layer(axum::middleware::from_fn_with_state(
            request_id_state,
            request_context::assign_request_id,
        ))
        .with_state(state)
}

/// Resolves when the process receives Ctrl+C.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

/// Starts the server on the configured port and runs until shutdown.
///
/// # Errors
/// Returns an error if the database cannot be prepared or the listener
/// cannot be bound.
pub async fn run(config: Config) -> Result<(), ServerError> {
    initialize_tracing(&config);
    info!(profile = ?config.profile, backend = ?config.bus.backend, "Starting server...");

    let metrics_handle = metrics_handle();
    let config = Arc::new(config);

    let pool = match config.bus.backend {
        BusBackend::Postgres => {
            let pool = create_database_pool(&config.db).await?;
            bootstrap::ensure_liveness(&pool).await?;
            bootstrap::run(&pool, &config.db).await?;
            bootstrap::ensure_readiness(&pool).await?;
            Some(pool)
        }
        BusBackend::Memory => {
            warn!(
                groups = config.directory.groups.len(),
                "using the in-memory chat log; history is lost on restart and only configured groups exist"
            );
            None
        }
    };

    let state = create_app_state(&config, pool)?;
    let app = create_app_router(state, config.clone(), metrics_handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    serve(listener, app)
        .with_graceful_shutdown(create_shutdown_signal())
        .await?;

    Ok(())
}
