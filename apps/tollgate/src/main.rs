mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tollgate_common::AppConfig;
use tollgate_core::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = cli::Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let state = AppState::bootstrap(config).await?;
    tollgate_core::run_maintenance_tasks(state.clone());

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/{*path}",
            post(tollgate_core::proxy_handler)
                .options(|| async { tollgate_core::cors_preflight_response() }),
        )
        .with_state(state.clone());

    let bind = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(target: "tollgate::lifecycle", %bind, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(tollgate_core::shutdown_signal(state))
    .await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue = state.scheduler.global_snapshot().await;
    let active_users = state.scheduler.active_user_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": tollgate_core::today_utc(),
        "queue": {
            "running": queue.running,
            "queued": queue.queued,
            "reservoir": queue.reservoir,
            "totalUsers": active_users,
        },
        "allowlist": {
            "enabled": state.config.allowlist.enabled,
        },
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> axum::response::Response {
    if !state.config.rate_limiting.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
