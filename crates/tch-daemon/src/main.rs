//! tch-daemon entry point: the Remote Order Service.
//!
//! Thin on purpose: load config, set up tracing, open and migrate the order
//! database, wire middleware, serve. Handlers live in `routes.rs`.
//!
//! Usage: `tch-daemon [config.yaml ...]` (layers in merge order).

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tch_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    let cfg = tch_config::load_desk_config(&paths)?;
    init_tracing(&cfg.logging.filter);

    let pool = tch_db::connect(&cfg.daemon.db_url).await?;
    tch_db::migrate(&pool).await?;

    let uploads = state::UploadStore::from_config(&cfg.daemon);
    tokio::fs::create_dir_all(uploads.dir())
        .await
        .with_context(|| format!("failed to create {}", uploads.dir().display()))?;

    let shared = Arc::new(state::AppState::new(pool, uploads));
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = cfg
        .daemon
        .bind_addr
        .parse()
        .with_context(|| format!("invalid daemon.bind_addr: {}", cfg.daemon.bind_addr))?;
    info!("tch-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    info!("tch-daemon stopped");
    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
