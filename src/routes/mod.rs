use axum::extract::FromRef;
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::services::scheduler::Monitor;

pub mod connections;
pub mod monitor;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub monitor: Arc<Monitor>,
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<Monitor> {
    fn from_ref(state: &AppState) -> Self {
        state.monitor.clone()
    }
}

pub fn routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    SqlitePool: FromRef<S>,
    Arc<Monitor>: FromRef<S>,
{
    Router::new()
        .route(
            "/connections",
            get(connections::list_connections).post(connections::register_connection),
        )
        .route("/connections/:account_id", get(connections::get_connection))
        .route("/connections/:account_id/enable", post(connections::enable_connection))
        .route("/connections/:account_id/disable", post(connections::disable_connection))
        .route("/connections/:account_id/reconcile", post(monitor::reconcile_account))
        .route("/monitor/run", post(monitor::run_monitor))
        .route("/monitor/status", get(monitor::monitor_status))
}

/// Full application router with state and request tracing attached.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
