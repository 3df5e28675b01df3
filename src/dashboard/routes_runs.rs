//! Trigger and history routes: single-account runs, batch start, batch
//! status and the account run log.

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use super::middleware_auth::RequireAdmin;
use super::{error_response, AppState};

#[derive(Deserialize)]
pub(super) struct DryRunQuery {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
pub(super) struct RunsQuery {
    account_id: Option<i64>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub(super) async fn handler_run_account(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    AxumPath(account_id): AxumPath<i64>,
    Query(query): Query<DryRunQuery>,
) -> impl IntoResponse {
    let account = match state.engine.store().get_account(account_id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("account {account_id} not found"))
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    info!(account_id, dry_run = query.dry_run, "manual account run");
    match state
        .engine
        .run_account(&account, query.dry_run, Utc::now())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            error!(account_id, error = %e, "manual account run failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub(super) async fn handler_batch_run(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(query): Query<DryRunQuery>,
) -> impl IntoResponse {
    match state.scheduler.try_start(query.dry_run).await {
        Ok(true) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "started",
                "instance": state.scheduler.instance_id(),
                "dry_run": query.dry_run,
            })),
        )
            .into_response(),
        Ok(false) => {
            let holder = state
                .engine
                .store()
                .batch_lock()
                .await
                .ok()
                .flatten()
                .map(|l| l.owner);
            Json(serde_json::json!({ "status": "already_running", "holder": holder }))
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub(super) async fn handler_batch_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let lock = match state.engine.store().batch_lock().await {
        Ok(lock) => lock,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    Json(serde_json::json!({
        "instance": state.scheduler.instance_id(),
        "running": lock.is_some(),
        "lock": lock,
        "last_batch": state.scheduler.last_summary().await,
    }))
    .into_response()
}

pub(super) async fn handler_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.clamp(1, 500);
    match state.engine.store().list_runs(query.account_id, limit).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
