//! # Dashboard: HTTP Trigger Surface
//!
//! Runs an Axum HTTP server that lets operators trigger account runs and
//! batches, inspect run history, and lets the platform probe liveness and
//! scrape metrics.
//!
//! | Endpoint | Auth | Purpose |
//! |----------|------|---------|
//! | `GET /healthz` | none | Liveness |
//! | `GET /readyz` | none | Store reachable |
//! | `GET /metrics` | none | Prometheus scrape |
//! | `POST /api/accounts/{id}/run` | admin | Run one account now |
//! | `POST /api/batch/run` | admin | Start a batch in the background |
//! | `GET /api/batch/status` | none | Lock holder and last batch summary |
//! | `GET /api/runs` | none | Recent account runs |

pub(crate) mod middleware_auth;
mod routes_health;
mod routes_runs;

use anyhow::Result;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};

use crate::pipeline::Engine;
use crate::prom_metrics;
use crate::scheduler::BatchScheduler;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<BatchScheduler>,
    /// Bearer token for admin routes. `None` runs in development mode.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(scheduler: Arc<BatchScheduler>, admin_token: Option<String>) -> Arc<Self> {
        let admin_token = admin_token.filter(|t| !t.trim().is_empty());
        if admin_token.is_none() {
            warn!("ADPILOT_ADMIN_TOKEN not set, admin routes are open (development mode)");
        }
        Arc::new(Self {
            engine: scheduler.engine().clone(),
            scheduler,
            admin_token,
        })
    }
}

/// JSON error body shared by every handler.
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .engine
        .metrics()
        .http_duration
        .get_or_create(&prom_metrics::HttpLabels {
            method,
            path: norm_path,
            status: response.status().as_u16(),
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse numeric ids and UUIDs into placeholders so the histogram's
/// path label stays low-cardinality.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .route(
            "/api/accounts/{id}/run",
            post(routes_runs::handler_run_account),
        )
        .route("/api/batch/run", post(routes_runs::handler_batch_run))
        .route("/api/batch/status", get(routes_runs::handler_batch_status))
        .route("/api/runs", get(routes_runs::handler_runs))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::new())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(300),
        ))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn run(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "adpilot listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed");
            }
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
