use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::db::now_epoch;
use crate::imap::MailboxClientFactory;
use crate::models::MailboxConnection;
use crate::secret::SecretResolver;
use crate::services::message_sync_service::{sync_mailbox, SyncResult};
use crate::services::reconcile_service::{force_reconcile, reconcile_mailbox, ReconciliationResult};
use crate::services::registry;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// A connection is reconciled again once its last pass is this old.
    pub reconcile_freshness_secs: i64,
    /// Upper bound on reconciliation passes per cycle.
    pub reconcile_batch_size: u32,
    pub connecting_stale_secs: i64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            reconcile_freshness_secs: 6 * 3600,
            reconcile_batch_size: 3,
            connecting_stale_secs: registry::DEFAULT_CONNECTING_STALE_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub due: usize,
    pub synced: usize,
    pub failed: usize,
    pub reconciled: usize,
    pub reconcile_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another cycle held the single-flight flag; nothing was touched.
    Skipped,
    Completed(CycleStats),
}

/// Clears the running flag on every exit path, panics included.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic, single-flight driver of incremental syncs and full reconciliation.
///
/// Connections are visited one after another so at most one mailbox socket is
/// open at a time and credentials are never used concurrently.
pub struct Monitor {
    pool: SqlitePool,
    clients: Arc<dyn MailboxClientFactory>,
    secrets: Arc<dyn SecretResolver>,
    settings: MonitorSettings,
    running: AtomicBool,
}

impl Monitor {
    pub fn new(
        pool: SqlitePool,
        clients: Arc<dyn MailboxClientFactory>,
        secrets: Arc<dyn SecretResolver>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            pool,
            clients,
            secrets,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(&self.running))
    }

    /// One monitor cycle. Returns `Skipped` at once if a cycle is in flight.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = self.try_begin() else {
            info!("previous monitor cycle still running, skipping");
            return CycleOutcome::Skipped;
        };

        let mut stats = CycleStats::default();
        let due = match registry::select_due_connections(
            &self.pool,
            now_epoch(),
            self.settings.connecting_stale_secs,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(error=%e, "monitor: selecting due connections failed");
                return CycleOutcome::Completed(stats);
            }
        };
        stats.due = due.len();
        if due.is_empty() {
            debug!("monitor: no connections due");
            return CycleOutcome::Completed(stats);
        }

        for conn in &due {
            match self.sync_connection(conn).await {
                Ok(true) => stats.synced += 1,
                Ok(false) => stats.failed += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(account_id=%conn.account_id, error=%e, "monitor: connection bookkeeping failed");
                }
            }
        }

        self.reconcile_stale(&mut stats).await;

        info!(
            due = stats.due,
            synced = stats.synced,
            failed = stats.failed,
            reconciled = stats.reconciled,
            reconcile_failed = stats.reconcile_failed,
            "monitor cycle completed"
        );
        CycleOutcome::Completed(stats)
    }

    /// Forced full reconciliation of one account under the same single-flight
    /// flag as the periodic cycle. `None` while a cycle (or another forced
    /// pass) is running.
    pub async fn reconcile_now(
        &self,
        account_id: &str,
    ) -> Option<anyhow::Result<ReconciliationResult>> {
        let Some(_guard) = self.try_begin() else {
            info!(account_id=%account_id, "monitor busy, forced reconciliation refused");
            return None;
        };
        Some(
            force_reconcile(
                &self.pool,
                self.clients.as_ref(),
                self.secrets.as_ref(),
                account_id,
                now_epoch(),
            )
            .await,
        )
    }

    /// Incremental sync of one connection plus its bookkeeping.
    /// `Ok(true)` on a clean sync, `Ok(false)` when the failure was recorded.
    async fn sync_connection(&self, conn: &MailboxConnection) -> anyhow::Result<bool> {
        registry::mark_connecting(&self.pool, &conn.account_id, now_epoch()).await?;

        let result = match self.secrets.resolve(conn) {
            Ok(config) => {
                let mut client = self.clients.create();
                sync_mailbox(
                    &self.pool,
                    client.as_mut(),
                    &conn.account_id,
                    &config,
                    conn.last_cursor,
                    conn.uid_validity,
                )
                .await
            }
            Err(e) => {
                warn!(account_id=%conn.account_id, error=%e, "monitor: credentials unusable");
                SyncResult::failed(conn.last_cursor, e.to_string())
            }
        };

        let finished = now_epoch();
        if !result.is_clean() {
            registry::mark_failed(&self.pool, conn, &result, finished).await?;
            return Ok(false);
        }
        if let Err(e) = registry::mark_synced(&self.pool, conn, &result, finished).await {
            let mut failed = result.clone();
            failed.errors.push(format!("persist sync state: {e}"));
            registry::mark_failed(&self.pool, conn, &failed, finished).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn reconcile_stale(&self, stats: &mut CycleStats) {
        if self.settings.reconcile_batch_size == 0 {
            return;
        }
        let candidates = match registry::select_reconciliation_candidates(
            &self.pool,
            now_epoch(),
            self.settings.reconcile_freshness_secs,
            self.settings.reconcile_batch_size,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(error=%e, "monitor: selecting reconciliation candidates failed");
                return;
            }
        };

        for conn in candidates {
            let config = match self.secrets.resolve(&conn) {
                Ok(c) => c,
                Err(e) => {
                    stats.reconcile_failed += 1;
                    warn!(account_id=%conn.account_id, error=%e, "reconciliation skipped: credentials unusable");
                    continue;
                }
            };
            let mut client = self.clients.create();
            let result =
                reconcile_mailbox(&self.pool, client.as_mut(), &conn.account_id, &config, now_epoch())
                    .await;
            if result.success {
                stats.reconciled += 1;
            } else {
                stats.reconcile_failed += 1;
                warn!(
                    account_id=%conn.account_id,
                    errors=?result.errors,
                    "reconciliation pass failed, retrying next window"
                );
            }
        }
    }
}

/// Drive `run_cycle` from a fixed interval. Each tick spawns its cycle, so a
/// tick landing during a slow cycle is observed and skipped, never queued.
pub fn start(monitor: Arc<Monitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = monitor.settings.interval.as_secs(), "monitor started");
        loop {
            ticker.tick().await;
            let m = monitor.clone();
            tokio::spawn(async move {
                if let CycleOutcome::Completed(stats) = m.run_cycle().await {
                    debug!(?stats, "monitor tick done");
                }
            });
        }
    })
}
