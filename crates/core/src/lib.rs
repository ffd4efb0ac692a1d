pub mod api;
pub mod app_state;
pub mod config;
pub mod identity;
pub mod webhook;

use anyhow::Context;
use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{
    ConsumeRequest, DeliveryResponse, StatsResponse, consume_key, deliver_key, log_request_errors,
    request_key, serve_payload, stats,
};
pub use app_state::AppState;
pub use config::{Config, Eligibility};
pub use identity::{IdentityExtractor, RequestContext};
pub use webhook::WebhookAuditSink;

/// Public routes: the entry point, delivery links and the protected payload.
pub fn external_router(state: AppState, entry_path: &str, payload_path: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(entry_path, get(request_key))
        .route("/k/{slug}", get(deliver_key))
        .route("/k/{slug}/consume", post(consume_key))
        .route(payload_path, get(serve_payload))
        .fallback(api::not_found)
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

/// Operator routes, bound to a separate port.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .fallback(api::not_found)
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Run until Ctrl-C or SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
    run_until(config, shutdown_signal()).await
}

/// Run both servers until `shutdown` resolves, then drain in-flight requests
/// and stop the background sweeps.
pub async fn run_until<F>(config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(&config).context("Failed to create app state")?;

    let external_app = external_router(state.clone(), &config.entry_path, &config.payload_path);
    let internal_app = internal_router(state.clone());

    // Start external API server
    let external_addr = format!("0.0.0.0:{}", config.listen_on_port);
    let external_listener = TcpListener::bind(&external_addr)
        .await
        .with_context(|| format!("Failed to bind external API on {external_addr}"))?;
    info!("External API listening on {external_addr}");

    // Start internal API server
    let internal_addr = format!("0.0.0.0:{}", config.internal_port);
    let internal_listener = TcpListener::bind(&internal_addr)
        .await
        .with_context(|| format!("Failed to bind internal API on {internal_addr}"))?;
    info!("Internal API listening on {internal_addr}");

    let sweeps = state.start_background_tasks();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown.await;
        info!("Shutdown requested");
        let _ = stop_tx.send(true);
    });

    let external = axum::serve(
        external_listener,
        external_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx.clone()));
    let internal = axum::serve(
        internal_listener,
        internal_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx));

    // Run both servers concurrently
    let result = tokio::try_join!(
        async { external.await.context("External API server error") },
        async { internal.await.context("Internal API server error") },
    );

    for sweep in sweeps {
        info!(task = sweep.name(), "Stopping background task");
        sweep.stop().await;
    }

    result.map(|_| ())
}

async fn stopped(mut stop_rx: watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(?error, "Failed to listen for SIGTERM");
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
}
