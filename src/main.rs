//! Settlement service HTTP entrypoint.
//!
//! Launches the Axum server for payment settlement, wallet registration,
//! loyalty tokens, and exchange rates, plus the five background
//! reconciliation loops. `SIGTERM`/`SIGINT` cancel the shared token; the
//! server and the job loops drain before exit.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `RESTAURANT_ID`, `RESTAURANT_WALLET_PUBLIC_KEY`,
//!   `LOYALTY_TOKEN_ISSUER_PUBLIC_KEY` identify the deployment
//! - `RUST_LOG` controls log filtering

use axum::Router;
use axum::http::Method;
use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use dinepay::app::App;
use dinepay::config::Config;
use dinepay::handlers;
use dinepay::jobs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    let addr = SocketAddr::new(config.host, config.port);
    let app = Arc::new(App::from_config(config));

    let shutdown = shutdown_token()?;
    let tracker = TaskTracker::new();
    jobs::spawn(app.clone(), &tracker, shutdown.clone());
    tracker.close();

    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .with_state(app)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    tracing::info!("Starting server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    // Let in-flight job ticks finish before exiting.
    tracker.wait().await;
    Ok(())
}

/// Returns a token cancelled on the first `SIGTERM` or `SIGINT`.
fn shutdown_token() -> Result<CancellationToken, std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM; shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT; shutting down"),
        }
        handle.cancel();
    });
    Ok(token)
}
