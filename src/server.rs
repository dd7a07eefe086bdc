use crate::{
    backend::{BackendQueryError, UsageBackend},
    usage::{BillingWindow, SessionSummary, TimeRange, UsageData},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

pub async fn spawn<B: UsageBackend>(listen_addr: &str, backend: Arc<B>) -> Result<ServerHandle> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("failed to parse listen_addr {listen_addr}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| "failed to bind api listener")?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(backend);
    let join = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %local_addr, "usage api listening");

    Ok(ServerHandle {
        local_addr,
        shutdown: Some(shutdown_tx),
        join,
    })
}

pub fn router<B: UsageBackend>(backend: Arc<B>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/usage", get(usage_data::<B>))
        .route("/api/billing-windows", get(billing_windows::<B>))
        .route("/api/sessions", get(sessions::<B>))
        .with_state(backend)
}

#[derive(Debug, Deserialize)]
struct UsageParams {
    range: TimeRange,
}

async fn health() -> &'static str {
    "ok"
}

async fn usage_data<B: UsageBackend>(
    State(backend): State<Arc<B>>,
    Query(params): Query<UsageParams>,
) -> Result<Json<UsageData>, ApiError> {
    Ok(Json(backend.usage_data(params.range).await?))
}

async fn billing_windows<B: UsageBackend>(
    State(backend): State<Arc<B>>,
) -> Result<Json<Vec<BillingWindow>>, ApiError> {
    Ok(Json(backend.billing_windows().await?))
}

async fn sessions<B: UsageBackend>(
    State(backend): State<Arc<B>>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(backend.session_breakdown().await?))
}

struct ApiError(BackendQueryError);

impl From<BackendQueryError> for ApiError {
    fn from(err: BackendQueryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "usage api query failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}
