use crate::config::Config;
use crate::session::SessionManager;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod error;
pub mod routes_hls;
pub mod routes_sessions;

pub use error::AppError;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::RANGE]);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", routes_sessions::session_routes())
        .nest("/hls", routes_hls::hls_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> &'static str {
    "ok"
}

/// Start the HTTP server and run until a shutdown signal arrives.
///
/// Every live session is closed before returning, so the storage root is
/// left empty.
pub async fn start_server(config: Config, manager: Arc<SessionManager>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting server on {}", addr);

    serve_until(listener, config, manager, shutdown_signal()).await
}

/// Serve on `listener` until `signal` resolves.
///
/// Sessions are closed as soon as the signal fires, before in-flight
/// requests are drained, so a create call waiting on its pipeline returns
/// instead of holding the drain open.
pub async fn serve_until<F>(
    listener: tokio::net::TcpListener,
    config: Config,
    manager: Arc<SessionManager>,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if config.sessions.reconcile_on_startup {
        match manager.reconcile_storage().await {
            Ok(removed) => tracing::info!("Removed {} orphaned session directories", removed),
            Err(e) => tracing::warn!("Startup storage reconciliation failed: {}", e),
        }
    }

    let shutdown = CancellationToken::new();
    let sweeper = manager.start_sweeper(shutdown.clone());

    let ctx = AppContext {
        manager: Arc::clone(&manager),
        config: Arc::new(config),
    };
    let app = create_router(ctx);

    let signal_token = shutdown.clone();
    let signal_manager = Arc::clone(&manager);
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            signal_token.cancel();
            signal_manager.shutdown().await;
        })
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Sweep task ended abnormally: {}", e);
    }
    // Sessions created while draining.
    manager.shutdown().await;

    serve_result?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
