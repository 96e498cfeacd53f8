//! HTTP surface: pipeline submission/status and sandbox job management.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use api::{AppState, SharedState};

use crate::config::BuildpipeConfig;
use crate::pipeline::Orchestrator;
use crate::queue::{JobQueue, QueueState, WorkerPool};
use crate::sandbox::{SandboxJobManager, SandboxTransaction};

/// How long shutdown waits for in-flight pipeline runs to wind down.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the HTTP listener.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for a locally served frontend.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the server together with the pipeline worker pool.
pub async fn start_server(config: BuildpipeConfig, server: ServerConfig) -> Result<()> {
    let sandbox = Arc::new(SandboxJobManager::from_settings(&config.sandbox));
    let queue = JobQueue::open(&config.queue)
        .await
        .context("Failed to open pipeline queue")?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config, sandbox.clone())?);
    match queue.count(QueueState::Waiting).await {
        Ok(waiting) => info!(waiting, workers = config.queue.workers, "pipeline queue opened"),
        Err(e) => warn!(error = %e, "failed to count waiting pipeline jobs"),
    }

    let cancel = CancellationToken::new();
    let workers = WorkerPool::new(
        queue.clone(),
        orchestrator,
        config.queue.workers,
        config.queue.poll_interval(),
    )
    .spawn(cancel.clone());

    let state = Arc::new(AppState {
        queue,
        sandbox: sandbox.clone(),
        transactions: SandboxTransaction::from_config(&config),
    });
    let app = build_router(state, server.dev_mode);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "buildpipe listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shutting down workers");
    cancel.cancel();
    let stopped = sandbox.shutdown();
    if stopped > 0 {
        info!(stopped, "stopped running sandbox jobs");
    }
    let drain = async {
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline worker ended abnormally");
            }
        }
    };
    if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("timed out waiting for pipeline workers to stop");
    }

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::queue::QueueDb;
    use crate::sandbox::InMemoryJobRegistry;

    fn test_router(dev_mode: bool) -> Router {
        let state = Arc::new(AppState {
            queue: JobQueue::new(QueueDb::new_in_memory().unwrap(), 1),
            sandbox: Arc::new(SandboxJobManager::new(
                "/nonexistent/engine",
                100,
                Arc::new(InMemoryJobRegistry::new()),
            )),
            transactions: SandboxTransaction::new(
                crate::workspace::Workspace::new(std::env::temp_dir().join("buildpipe-server-tests")),
                "alpine",
                "/workspace",
            ),
        });
        build_router(state, dev_mode)
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let response = test_router(false)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = test_router(false)
            .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dev_mode_allows_cross_origin() {
        let request = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let response = test_router(true).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }
}
