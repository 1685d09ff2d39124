use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

const BOOTSTRAP_SQL: &str = include_str!("../../migrations/0001_inbound.sql");

/// Open (creating if needed) the SQLite database behind `database_url`.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let url = normalize_sqlite_url(database_url);
    if url == "sqlite::memory:" {
        return connect_memory().await;
    }
    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("invalid database url {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with the schema applied.
pub async fn connect_memory() -> Result<SqlitePool> {
    // every pooled connection would otherwise get its own empty database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply the bootstrap schema. Every statement is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for stmt in BOOTSTRAP_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("migration statement failed: {}", first_line(stmt)))?;
    }
    Ok(())
}

fn first_line(stmt: &str) -> &str {
    stmt.lines()
        .find(|l| !l.trim_start().starts_with("--"))
        .unwrap_or(stmt)
}

/// Accept `sqlite:foo.db`, `sqlite://foo.db`, `file:foo.db` or a bare path.
pub fn normalize_sqlite_url(input: &str) -> String {
    if input.starts_with("sqlite://") || input.starts_with("sqlite::memory:") {
        return input.to_string();
    }
    if let Some(rest) = input.strip_prefix("sqlite:") {
        return format!("sqlite://{}", rest.trim_start_matches('/'));
    }
    if let Some(rest) = input.strip_prefix("file:") {
        return format!("sqlite://{}", rest);
    }
    format!("sqlite://{}", input)
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
