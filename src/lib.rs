pub mod api;
pub mod blob;
pub mod chest;
pub mod config;
pub mod db;
pub mod error;
pub mod ids;
pub mod reaper;
pub mod token;
pub mod totp;

use api::{create_api_router, AppState};
use axum::Router;
use blob::{BlobStore, FsBlobStore};
use chest::ChestEngine;
use config::Config;
use db::MetadataStore;
use std::io::IsTerminal;
use std::sync::Arc;
use token::TokenService;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_rapidoc::RapiDoc;

/// Initialize the tracing subscriber for logging.
/// Uses journald when running as a service (no terminal), fmt when running interactively.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chestd=info,tower_http=warn".into());

    if std::io::stdout().is_terminal() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_journald::layer().expect("Failed to connect to journald"))
            .init();
    }
}

/// Run the chest service.
pub async fn run_service(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    tracing::info!("chestd version {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path)?;
    tracing::info!("starting server with config: {:?}", config);

    tokio::fs::create_dir_all(&config.storage.data_path).await?;

    let db = MetadataStore::connect(&config.storage.database_url).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage.data_path.clone()));
    let tokens = TokenService::new(&config.auth.jwt_secret);
    let totp_secrets = totp::parse_secrets(&config.auth.totp_secrets);

    reaper::spawn_reaper_task(
        db.clone(),
        Arc::clone(&blobs),
        config.reaper.sweep_interval_secs,
        config.reaper.abandoned_after_secs,
    );

    let engine = ChestEngine::new(db, blobs, tokens, config.auth.require_totp, totp_secrets);
    let state = Arc::new(AppState {
        engine,
        config: config.clone(),
    });

    let (api_router, api_doc) = create_api_router(state.clone()).split_for_parts();

    let doc_routes = Router::new()
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", api_doc).path("/api-docs"));

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION]);

    let app = Router::new()
        .nest("/api", api_router)
        .merge(doc_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(
            config.server.max_payload_size.as_u64() as usize,
        ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on {}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
