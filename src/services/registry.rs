//! Connection registry: which mailboxes exist, which are due, and the
//! bookkeeping written after every attempt.
//!
//! Each transition is one UPDATE so a reader never sees a connection as
//! `active` next to a stale cursor or failure count.
use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::models::{ConnectionStatus, MailboxConnection, NewConnection};
use crate::services::backoff;
use crate::services::message_sync_service::SyncResult;

const CONNECTION_COLUMNS: &str = "account_id, imap_host, imap_port, use_tls, username, \
     credentials_encrypted, folder, list_uids, sync_interval_minutes, last_cursor, uid_validity, \
     status, enabled, consecutive_failures, total_messages_processed, last_attempt_at, \
     last_successful_connection_at, last_error, last_full_reconciliation_at, next_sync_at, \
     created_at, updated_at";

/// `connecting` rows older than this are assumed abandoned by a crashed process.
pub const DEFAULT_CONNECTING_STALE_SECS: i64 = 60 * 60;

const MAX_ERROR_LEN: usize = 2000;

/// Create a connection, or refresh host settings and re-enable an existing one.
/// Sync progress (cursor, failure count) survives re-registration.
pub async fn register_connection(
    pool: &SqlitePool,
    new: &NewConnection,
    credentials_encrypted: &str,
    now: i64,
) -> Result<MailboxConnection> {
    sqlx::query(
        r#"
        INSERT INTO mailbox_connections (
            account_id, imap_host, imap_port, use_tls, username,
            credentials_encrypted, folder, list_uids, sync_interval_minutes,
            status, enabled, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', 1, ?, ?)
        ON CONFLICT(account_id) DO UPDATE SET
            imap_host = excluded.imap_host,
            imap_port = excluded.imap_port,
            use_tls = excluded.use_tls,
            username = excluded.username,
            credentials_encrypted = excluded.credentials_encrypted,
            folder = excluded.folder,
            list_uids = excluded.list_uids,
            sync_interval_minutes = excluded.sync_interval_minutes,
            enabled = 1,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&new.account_id)
    .bind(&new.imap_host)
    .bind(new.imap_port)
    .bind(new.use_tls)
    .bind(&new.username)
    .bind(credentials_encrypted)
    .bind(&new.folder)
    .bind(new.list_uids)
    .bind(new.sync_interval_minutes.max(1))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    match get_connection(pool, &new.account_id).await? {
        Some(c) => Ok(c),
        None => bail!("connection {} missing after insert", new.account_id),
    }
}

pub async fn get_connection(pool: &SqlitePool, account_id: &str) -> Result<Option<MailboxConnection>> {
    let sql = format!("SELECT {CONNECTION_COLUMNS} FROM mailbox_connections WHERE account_id = ?");
    let row = sqlx::query_as::<_, MailboxConnection>(&sql)
        .bind(account_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_connections(pool: &SqlitePool) -> Result<Vec<MailboxConnection>> {
    let sql = format!("SELECT {CONNECTION_COLUMNS} FROM mailbox_connections ORDER BY account_id");
    let rows = sqlx::query_as::<_, MailboxConnection>(&sql)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Soft enable/disable. Returns false when the account has no connection.
pub async fn set_enabled(pool: &SqlitePool, account_id: &str, enabled: bool, now: i64) -> Result<bool> {
    let res = sqlx::query("UPDATE mailbox_connections SET enabled = ?, updated_at = ? WHERE account_id = ?")
        .bind(enabled)
        .bind(now)
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Connections whose incremental sync is due at `now`. Pure read.
///
/// `error` rows are included so backoff retries happen once their
/// `next_sync_at` passes; `connecting` rows only once their attempt is
/// older than `connecting_stale_secs`.
pub async fn select_due_connections(
    pool: &SqlitePool,
    now: i64,
    connecting_stale_secs: i64,
) -> Result<Vec<MailboxConnection>> {
    let sql = format!(
        r#"
        SELECT {CONNECTION_COLUMNS} FROM mailbox_connections
        WHERE enabled = 1
          AND TRIM(imap_host) <> ''
          AND (next_sync_at IS NULL OR next_sync_at <= ?)
          AND (
            status IN ('active', 'error')
            OR (status = 'connecting' AND (last_attempt_at IS NULL OR last_attempt_at <= ?))
          )
        ORDER BY next_sync_at IS NOT NULL, next_sync_at, account_id
        "#
    );
    let rows = sqlx::query_as::<_, MailboxConnection>(&sql)
        .bind(now)
        .bind(now - connecting_stale_secs)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Flag the attempt as in flight before any network I/O.
pub async fn mark_connecting(pool: &SqlitePool, account_id: &str, now: i64) -> Result<()> {
    let res = sqlx::query(
        "UPDATE mailbox_connections SET status = ?, last_attempt_at = ?, updated_at = ? WHERE account_id = ?",
    )
    .bind(ConnectionStatus::Connecting.as_str())
    .bind(now)
    .bind(now)
    .bind(account_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        bail!("no connection for account {account_id}");
    }
    Ok(())
}

/// Record an error-free incremental sync.
pub async fn mark_synced(
    pool: &SqlitePool,
    conn: &MailboxConnection,
    result: &SyncResult,
    now: i64,
) -> Result<()> {
    if !result.is_clean() {
        bail!("sync result for {} carries errors", conn.account_id);
    }
    let next = now + conn.sync_interval_secs();
    let res = sqlx::query(
        r#"
        UPDATE mailbox_connections SET
            status = ?,
            last_cursor = ?,
            uid_validity = COALESCE(?, uid_validity),
            total_messages_processed = total_messages_processed + ?,
            consecutive_failures = 0,
            last_successful_connection_at = ?,
            last_error = NULL,
            next_sync_at = ?,
            updated_at = ?
        WHERE account_id = ?
        "#,
    )
    .bind(ConnectionStatus::Active.as_str())
    .bind(result.last_processed_cursor)
    .bind(result.uid_validity)
    .bind(result.new_count as i64)
    .bind(now)
    .bind(next)
    .bind(now)
    .bind(&conn.account_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        bail!("no connection for account {}", conn.account_id);
    }
    Ok(())
}

/// Record a failed or partially failed attempt and schedule the retry from
/// the backoff curve.
///
/// The cursor still moves to `result.last_processed_cursor`: messages that
/// failed to parse were skipped on purpose and are not fetched again. On a
/// connection failure the result carries the old cursor, so nothing moves.
pub async fn mark_failed(
    pool: &SqlitePool,
    conn: &MailboxConnection,
    result: &SyncResult,
    now: i64,
) -> Result<()> {
    let failures = conn.consecutive_failures.saturating_add(1);
    let next = backoff::next_retry_at(now, failures);
    let mut message = result.errors.join("; ");
    if message.is_empty() {
        message = "unknown error".to_string();
    }
    if message.len() > MAX_ERROR_LEN {
        message = message.chars().take(MAX_ERROR_LEN).collect();
    }
    let res = sqlx::query(
        r#"
        UPDATE mailbox_connections SET
            status = ?,
            last_cursor = ?,
            uid_validity = COALESCE(?, uid_validity),
            total_messages_processed = total_messages_processed + ?,
            consecutive_failures = ?,
            last_error = ?,
            next_sync_at = ?,
            updated_at = ?
        WHERE account_id = ?
        "#,
    )
    .bind(ConnectionStatus::Error.as_str())
    .bind(result.last_processed_cursor)
    .bind(result.uid_validity)
    .bind(result.new_count as i64)
    .bind(failures)
    .bind(&message)
    .bind(next)
    .bind(now)
    .bind(&conn.account_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        bail!("no connection for account {}", conn.account_id);
    }
    Ok(())
}

pub async fn mark_reconciled(pool: &SqlitePool, account_id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE mailbox_connections SET last_full_reconciliation_at = ?, updated_at = ? WHERE account_id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(account_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Healthy connections whose last full reconciliation is missing or older
/// than `window_secs`, stalest first.
pub async fn select_reconciliation_candidates(
    pool: &SqlitePool,
    now: i64,
    window_secs: i64,
    limit: u32,
) -> Result<Vec<MailboxConnection>> {
    let sql = format!(
        r#"
        SELECT {CONNECTION_COLUMNS} FROM mailbox_connections
        WHERE enabled = 1
          AND TRIM(imap_host) <> ''
          AND status = 'active'
          AND (last_full_reconciliation_at IS NULL OR last_full_reconciliation_at <= ?)
        ORDER BY last_full_reconciliation_at IS NOT NULL, last_full_reconciliation_at, account_id
        LIMIT ?
        "#
    );
    let rows = sqlx::query_as::<_, MailboxConnection>(&sql)
        .bind(now - window_secs)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn new_conn(id: &str, host: &str) -> NewConnection {
        NewConnection {
            account_id: id.to_string(),
            imap_host: host.to_string(),
            imap_port: 993,
            use_tls: true,
            username: format!("{id}@example.com"),
            password: "secret".into(),
            folder: "INBOX".into(),
            list_uids: true,
            sync_interval_minutes: 15,
        }
    }

    fn clean(cursor: u32, new_count: u32) -> SyncResult {
        SyncResult {
            new_count,
            reactivated_count: 0,
            last_processed_cursor: cursor,
            uid_validity: Some(1),
            errors: vec![],
        }
    }

    #[tokio::test]
    async fn fresh_connections_are_due_and_hostless_are_not() {
        let pool = db::connect_memory().await.unwrap();
        register_connection(&pool, &new_conn("a", "imap.a.test"), "blob", 100).await.unwrap();
        register_connection(&pool, &new_conn("b", "  "), "blob", 100).await.unwrap();
        let due = select_due_connections(&pool, 100, DEFAULT_CONNECTING_STALE_SECS).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].account_id, "a");
        assert_eq!(due[0].status, ConnectionStatus::Active);
    }

    #[tokio::test]
    async fn synced_connection_waits_for_interval() {
        let pool = db::connect_memory().await.unwrap();
        let conn = register_connection(&pool, &new_conn("a", "h"), "blob", 0).await.unwrap();
        mark_connecting(&pool, "a", 1_000).await.unwrap();
        mark_synced(&pool, &conn, &clean(105, 3), 1_010).await.unwrap();

        let row = get_connection(&pool, "a").await.unwrap().unwrap();
        assert_eq!(row.status, ConnectionStatus::Active);
        assert_eq!(row.last_cursor, 105);
        assert_eq!(row.total_messages_processed, 3);
        assert_eq!(row.consecutive_failures, 0);
        assert_eq!(row.next_sync_at, Some(1_010 + 15 * 60));
        assert_eq!(row.last_successful_connection_at, Some(1_010));

        assert!(select_due_connections(&pool, 1_011, 3600).await.unwrap().is_empty());
        assert_eq!(select_due_connections(&pool, 1_010 + 900, 3600).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failures_back_off_and_reset_on_success() {
        let pool = db::connect_memory().await.unwrap();
        let conn = register_connection(&pool, &new_conn("a", "h"), "blob", 0).await.unwrap();
        let timeout = SyncResult::failed(conn.last_cursor, "timeout");
        mark_failed(&pool, &conn, &timeout, 100).await.unwrap();
        let row = get_connection(&pool, "a").await.unwrap().unwrap();
        assert_eq!(row.status, ConnectionStatus::Error);
        assert_eq!(row.consecutive_failures, 1);
        assert_eq!(row.next_sync_at, Some(100 + 300));
        assert_eq!(row.last_error.as_deref(), Some("timeout"));
        assert_eq!(row.last_cursor, 0);

        let mut partial = clean(12, 2);
        partial.errors = vec!["a".into(), "b".into()];
        mark_failed(&pool, &row, &partial, 400).await.unwrap();
        let row = get_connection(&pool, "a").await.unwrap().unwrap();
        assert_eq!(row.consecutive_failures, 2);
        assert_eq!(row.next_sync_at, Some(400 + 600));
        assert_eq!(row.last_error.as_deref(), Some("a; b"));
        // parse failures do not hold the cursor back
        assert_eq!(row.last_cursor, 12);
        assert_eq!(row.total_messages_processed, 2);

        // error rows come back once the backoff elapsed
        assert!(select_due_connections(&pool, 999, 3600).await.unwrap().is_empty());
        assert_eq!(select_due_connections(&pool, 1_000, 3600).await.unwrap().len(), 1);

        mark_synced(&pool, &row, &clean(1, 0), 1_000).await.unwrap();
        let row = get_connection(&pool, "a").await.unwrap().unwrap();
        assert_eq!(row.consecutive_failures, 0);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn mark_synced_refuses_dirty_result() {
        let pool = db::connect_memory().await.unwrap();
        let conn = register_connection(&pool, &new_conn("a", "h"), "blob", 0).await.unwrap();
        let mut dirty = clean(5, 1);
        dirty.errors.push("bad header".into());
        assert!(mark_synced(&pool, &conn, &dirty, 10).await.is_err());
        let row = get_connection(&pool, "a").await.unwrap().unwrap();
        assert_eq!(row.last_cursor, 0);
    }

    #[tokio::test]
    async fn stale_connecting_rows_recover() {
        let pool = db::connect_memory().await.unwrap();
        register_connection(&pool, &new_conn("a", "h"), "blob", 0).await.unwrap();
        mark_connecting(&pool, "a", 1_000).await.unwrap();
        assert!(select_due_connections(&pool, 1_500, 3600).await.unwrap().is_empty());
        assert_eq!(select_due_connections(&pool, 4_600, 3600).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_connections_are_never_due() {
        let pool = db::connect_memory().await.unwrap();
        register_connection(&pool, &new_conn("a", "h"), "blob", 0).await.unwrap();
        assert!(set_enabled(&pool, "a", false, 5).await.unwrap());
        assert!(!set_enabled(&pool, "missing", false, 5).await.unwrap());
        assert!(select_due_connections(&pool, 10, 3600).await.unwrap().is_empty());
        assert!(select_reconciliation_candidates(&pool, 10, 60, 5).await.unwrap().is_empty());

        // re-registering re-enables
        register_connection(&pool, &new_conn("a", "h"), "blob", 20).await.unwrap();
        assert_eq!(select_due_connections(&pool, 20, 3600).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_candidates_respect_window_and_limit() {
        let pool = db::connect_memory().await.unwrap();
        for id in ["a", "b", "c"] {
            register_connection(&pool, &new_conn(id, "h"), "blob", 0).await.unwrap();
        }
        let window = 6 * 3600;
        mark_reconciled(&pool, "a", 100_000).await.unwrap();
        mark_reconciled(&pool, "b", 100_000 - window - 1).await.unwrap();

        let picked = select_reconciliation_candidates(&pool, 100_000, window, 10).await.unwrap();
        let ids: Vec<_> = picked.iter().map(|c| c.account_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);

        let capped = select_reconciliation_candidates(&pool, 100_000, window, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].account_id, "c");
    }
}
