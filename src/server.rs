//! REST boundary of the daemon.
//!
//! GET /liveness        - 200 as long as the process serves requests
//! GET /readiness       - 200 once the scheduler is serving chains, 503 before
//! GET /startchain?id=N - queue chain N for immediate execution
//! GET /stopchain?id=N  - cancel every running instance of chain N
//!
//! Start and stop requests are forwarded as operator signals on the
//! scheduler's notification channel, so a chain started over HTTP takes the
//! same path as one started with `pg_notify` from SQL.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use timetable_core::{Error, Gateway, Result};

/// What the REST handlers need from the scheduler side
#[async_trait]
pub trait RestHandler: Send + Sync {
    /// Whether the scheduler is connected and serving chains
    fn is_ready(&self) -> bool;
    /// Queue a chain for immediate execution
    async fn start_chain(&self, chain_id: i64) -> Result<()>;
    /// Cancel every running instance of a chain
    async fn stop_chain(&self, chain_id: i64) -> Result<()>;
}

/// Live scheduler handle backed by the configuration database.
///
/// `main` arms and disarms the readiness flag around the engine's reconnect
/// loop; chain commands are published as notifications for the engine's
/// listener to pick up.
pub struct SchedulerHandle {
    gateway: Arc<Gateway>,
    ready: AtomicBool,
}

impl SchedulerHandle {
    /// Create a handle in the not-ready state
    pub fn new(gateway: Arc<Gateway>) -> Arc<Self> {
        Arc::new(Self { gateway, ready: AtomicBool::new(false) })
    }

    /// Flip the readiness flag reported by `/readiness`
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

#[async_trait]
impl RestHandler for SchedulerHandle {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn start_chain(&self, chain_id: i64) -> Result<()> {
        if chain_id <= 0 {
            return Err(Error::validation("invalid chain id"));
        }
        self.gateway.notify_chain_start(chain_id).await
    }

    async fn stop_chain(&self, chain_id: i64) -> Result<()> {
        if chain_id <= 0 {
            return Err(Error::validation("invalid chain id"));
        }
        self.gateway.notify_chain_stop(chain_id).await
    }
}

#[derive(Debug, Deserialize)]
struct ChainQuery {
    id: i64,
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn readiness(State(handler): State<Arc<dyn RestHandler>>) -> StatusCode {
    debug!("Received /readiness REST API request");
    if handler.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn start_chain(
    State(handler): State<Arc<dyn RestHandler>>,
    Query(query): Query<ChainQuery>,
) -> Response {
    debug!("Received /startchain REST API request");
    chain_response(handler.start_chain(query.id).await)
}

async fn stop_chain(
    State(handler): State<Arc<dyn RestHandler>>,
    Query(query): Query<ChainQuery>,
) -> Response {
    debug!("Received /stopchain REST API request");
    chain_response(handler.stop_chain(query.id).await)
}

fn chain_response(result: Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// Build the REST router over the given scheduler handle
pub fn router(handler: Arc<dyn RestHandler>) -> Router {
    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/startchain", get(start_chain))
        .route("/stopchain", get(stop_chain))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

/// Serve the REST API on all interfaces until `token` fires
pub async fn serve(
    port: u16,
    handler: Arc<dyn RestHandler>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind REST API address")?;
    info!("REST API server listening on http://{}", addr);

    axum::serve(listener, router(handler))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("REST API server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct StubHandler {
        ready: AtomicBool,
    }

    #[async_trait]
    impl RestHandler for StubHandler {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Relaxed)
        }

        async fn start_chain(&self, chain_id: i64) -> Result<()> {
            if chain_id <= 0 {
                return Err(Error::validation("invalid chain id"));
            }
            Ok(())
        }

        async fn stop_chain(&self, _chain_id: i64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_liveness_always_ok() {
        assert_eq!(liveness().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let stub = Arc::new(StubHandler::default());
        let handler: Arc<dyn RestHandler> = stub.clone();

        assert_eq!(
            readiness(State(handler.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        stub.ready.store(true, Ordering::Relaxed);
        assert_eq!(readiness(State(handler)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_chain_ok() {
        let handler: Arc<dyn RestHandler> = Arc::new(StubHandler::default());
        let response = start_chain(State(handler), Query(ChainQuery { id: 1 })).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_chain_rejects_bad_id() {
        let handler: Arc<dyn RestHandler> = Arc::new(StubHandler::default());
        let response = start_chain(State(handler), Query(ChainQuery { id: 0 })).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("invalid chain id"));
    }

    #[tokio::test]
    async fn test_stop_chain_ok() {
        let handler: Arc<dyn RestHandler> = Arc::new(StubHandler::default());
        let response = stop_chain(State(handler), Query(ChainQuery { id: 7 })).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
