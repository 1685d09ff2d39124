use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::db::now_epoch;
use crate::models::{MailboxConnection, NewConnection};
use crate::secret::Base64Secrets;
use crate::services::registry;

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// GET /connections
pub async fn list_connections(
    State(pool): State<SqlitePool>,
) -> Result<Json<Vec<MailboxConnection>>, (StatusCode, String)> {
    let conns = registry::list_connections(&pool).await.map_err(internal)?;
    Ok(Json(conns))
}

/// GET /connections/:account_id
pub async fn get_connection(
    State(pool): State<SqlitePool>,
    Path(account_id): Path<String>,
) -> Result<Json<MailboxConnection>, (StatusCode, String)> {
    registry::get_connection(&pool, &account_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Connection not found".to_string()))
}

/// POST /connections - register or replace an account's mailbox connection
pub async fn register_connection(
    State(pool): State<SqlitePool>,
    Json(req): Json<NewConnection>,
) -> Result<(StatusCode, Json<MailboxConnection>), (StatusCode, String)> {
    if req.account_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "account_id is required".into()));
    }
    if req.password.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "password is required".into()));
    }
    if req.folder.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "folder must not be empty".into()));
    }
    let sealed = Base64Secrets::seal(&req.username, &req.password);
    let conn = registry::register_connection(&pool, &req, &sealed, now_epoch())
        .await
        .map_err(internal)?;
    tracing::info!(account_id=%conn.account_id, host=%conn.imap_host, "mailbox connection registered");
    Ok((StatusCode::CREATED, Json(conn)))
}

/// POST /connections/:account_id/enable
pub async fn enable_connection(
    State(pool): State<SqlitePool>,
    Path(account_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    toggle(&pool, &account_id, true).await
}

/// POST /connections/:account_id/disable
pub async fn disable_connection(
    State(pool): State<SqlitePool>,
    Path(account_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    toggle(&pool, &account_id, false).await
}

async fn toggle(
    pool: &SqlitePool,
    account_id: &str,
    enabled: bool,
) -> Result<Json<Value>, (StatusCode, String)> {
    let found = registry::set_enabled(pool, account_id, enabled, now_epoch())
        .await
        .map_err(internal)?;
    if !found {
        return Err((StatusCode::NOT_FOUND, "Connection not found".to_string()));
    }
    tracing::info!(account_id=%account_id, enabled, "connection toggled");
    Ok(Json(json!({ "account_id": account_id, "enabled": enabled })))
}
