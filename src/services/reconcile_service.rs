//! Full reconciliation: archive local copies of messages that were deleted
//! on the server.
//!
//! The server listing is authoritative but only when it is provably whole.
//! Anything short of that aborts the pass before a single row is touched.
use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::imap::{FolderStatus, MailboxClient, MailboxClientFactory, ServerListing};
use crate::models::{MailboxConfig, StoredMessage};
use crate::secret::SecretResolver;
use crate::services::{message_store, registry};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationResult {
    pub archived_count: u64,
    pub errors: Vec<String>,
    pub success: bool,
}

impl ReconciliationResult {
    fn aborted(error: impl Into<String>) -> Self {
        Self {
            archived_count: 0,
            errors: vec![error.into()],
            success: false,
        }
    }
}

/// Why a listing cannot be trusted, if it cannot.
pub fn listing_problem(
    listing: &ServerListing,
    folder: &FolderStatus,
    local_active: usize,
) -> Option<String> {
    if !listing.complete {
        return Some("server listing flagged incomplete".into());
    }
    if listing.uids.is_none() && listing.message_ids.is_none() {
        return Some("server exposed no identifiers".into());
    }
    if let Some(uids) = &listing.uids {
        if (uids.len() as u64) < folder.exists as u64 {
            return Some(format!(
                "listing holds {} UIDs but folder reports {} messages",
                uids.len(),
                folder.exists
            ));
        }
    }
    if listing.is_empty() && folder.exists > 0 {
        return Some(format!("empty listing for a folder of {} messages", folder.exists));
    }
    if listing.is_empty() && local_active > 0 {
        return Some(format!("empty listing while {local_active} local messages are active"));
    }
    None
}

/// Row ids of local active messages absent from the server.
///
/// Message-ID is the primary key; the UID set is consulted only for rows
/// without a usable Message-ID, or when the server listed no Message-IDs.
/// A UID issued under an older UIDVALIDITY names nothing on the server any
/// more. A row that neither key can decide is kept.
pub fn deletion_candidates(
    local: &[StoredMessage],
    listing: &ServerListing,
    uid_validity: Option<u32>,
) -> Vec<i64> {
    local
        .iter()
        .filter(|m| m.is_active())
        .filter(|m| match (&m.message_id, &listing.message_ids) {
            (Some(mid), Some(ids)) => !ids.contains(mid),
            _ => {
                let Some(uids) = listing.uids.as_ref() else {
                    return false;
                };
                match (m.uid_validity, uid_validity) {
                    (Some(stored), Some(current)) if stored != current => true,
                    _ => !uids.contains(&m.uid),
                }
            }
        })
        .map(|m| m.id)
        .collect()
}

/// One full reconciliation pass for an account's primary folder.
///
/// Local rows are read before the server is listed: a message stored by a
/// concurrent sync after that point is simply not considered this pass.
pub async fn reconcile_mailbox(
    pool: &SqlitePool,
    client: &mut dyn MailboxClient,
    account_id: &str,
    config: &MailboxConfig,
    now: i64,
) -> ReconciliationResult {
    let local = match message_store::find_active_messages(pool, account_id, &config.folder).await {
        Ok(v) => v,
        Err(e) => return ReconciliationResult::aborted(format!("load local messages: {e}")),
    };

    let listed = list_server(client, config).await;
    client.disconnect().await;
    let (folder, listing) = match listed {
        Ok(v) => v,
        Err(e) => {
            warn!(account_id=%account_id, error=%e, "reconciliation listing failed");
            return ReconciliationResult::aborted(e.to_string());
        }
    };

    if let Some(problem) = listing_problem(&listing, &folder, local.len()) {
        warn!(account_id=%account_id, %problem, "reconciliation aborted, nothing archived");
        return ReconciliationResult::aborted(problem);
    }

    let candidates = deletion_candidates(&local, &listing, folder.uid_validity);
    let archived_count = match message_store::archive_by_ids(pool, &candidates, now).await {
        Ok(n) => n,
        Err(e) => return ReconciliationResult::aborted(format!("archive: {e}")),
    };

    if let Err(e) = registry::mark_reconciled(pool, account_id, now).await {
        return ReconciliationResult {
            archived_count,
            errors: vec![format!("record reconciliation: {e}")],
            success: false,
        };
    }

    info!(
        account_id=%account_id,
        local=local.len(),
        server=listing.len(),
        archived=archived_count,
        "full reconciliation finished"
    );
    ReconciliationResult {
        archived_count,
        errors: Vec::new(),
        success: true,
    }
}

async fn list_server(
    client: &mut dyn MailboxClient,
    config: &MailboxConfig,
) -> Result<(FolderStatus, ServerListing)> {
    client.connect(config).await?;
    let folder = client.open_folder(&config.folder).await?;
    let listing = client.list_identifiers(config.list_uids).await?;
    Ok((folder, listing))
}

/// Manual recovery entrypoint: reconcile one account now, outside the
/// periodic cycle. Same algorithm, same guarantees.
pub async fn force_reconcile(
    pool: &SqlitePool,
    clients: &dyn MailboxClientFactory,
    secrets: &dyn SecretResolver,
    account_id: &str,
    now: i64,
) -> Result<ReconciliationResult> {
    let Some(conn) = registry::get_connection(pool, account_id).await? else {
        bail!("no mailbox connection for account {account_id}");
    };
    if !conn.has_host() {
        bail!("account {account_id} has no mailbox host configured");
    }
    let config = match secrets.resolve(&conn) {
        Ok(c) => c,
        Err(e) => return Ok(ReconciliationResult::aborted(e.to_string())),
    };
    info!(account_id=%account_id, "forced full reconciliation");
    let mut client = clients.create();
    Ok(reconcile_mailbox(pool, client.as_mut(), account_id, &config, now).await)
}
