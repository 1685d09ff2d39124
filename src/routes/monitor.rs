use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::services::reconcile_service::ReconciliationResult;
use crate::services::registry;
use crate::services::scheduler::{CycleOutcome, Monitor};

/// POST /monitor/run - run one cycle now; reports `skipped` if one is in flight
pub async fn run_monitor(State(monitor): State<Arc<Monitor>>) -> Json<CycleOutcome> {
    Json(monitor.run_cycle().await)
}

/// GET /monitor/status
pub async fn monitor_status(State(monitor): State<Arc<Monitor>>) -> Json<Value> {
    let settings = monitor.settings();
    Json(json!({
        "running": monitor.is_running(),
        "interval_secs": settings.interval.as_secs(),
        "reconcile_freshness_secs": settings.reconcile_freshness_secs,
        "reconcile_batch_size": settings.reconcile_batch_size,
    }))
}

/// POST /connections/:account_id/reconcile - forced full reconciliation, 409 while a cycle runs
pub async fn reconcile_account(
    State(monitor): State<Arc<Monitor>>,
    Path(account_id): Path<String>,
) -> Result<Json<ReconciliationResult>, (StatusCode, String)> {
    let conn = registry::get_connection(monitor.pool(), &account_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Connection not found".to_string()))?;
    if !conn.has_host() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Connection has no mailbox host".to_string(),
        ));
    }

    match monitor.reconcile_now(&account_id).await {
        Some(result) => result
            .map(Json)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        None => Err((
            StatusCode::CONFLICT,
            "Monitor cycle in progress, retry later".to_string(),
        )),
    }
}
