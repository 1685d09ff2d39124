use anyhow::{anyhow, bail, Context, Result};
use mail_parser::MessageParser;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::db::now_epoch;
use crate::imap::{FetchedMessage, MailboxClient, FETCH_CHUNK};
use crate::models::{normalize_message_id, MailboxConfig, NewMessage};
use crate::services::message_store::{self, UpsertOutcome};

/// Outcome of one incremental sync attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub new_count: u32,
    pub reactivated_count: u32,
    pub last_processed_cursor: u32,
    pub uid_validity: Option<u32>,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn starting_at(cursor: u32) -> Self {
        Self {
            last_processed_cursor: cursor,
            ..Default::default()
        }
    }

    /// An attempt that never reached the mailbox.
    pub fn failed(cursor: u32, error: impl Into<String>) -> Self {
        Self {
            last_processed_cursor: cursor,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse the header block of a fetched message.
pub fn parse_message(fetched: &FetchedMessage) -> Result<NewMessage> {
    if fetched.header.iter().all(|b| b.is_ascii_whitespace()) {
        bail!("empty header block");
    }
    let parsed = MessageParser::default()
        .parse(&fetched.header[..])
        .ok_or_else(|| anyhow!("unparseable header block"))?;

    let message_id = parsed.message_id().and_then(normalize_message_id);
    let from_addr = parsed
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::to_string);
    let to_addr = parsed
        .to()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::to_string);
    let subject = parsed.subject().map(str::to_string);
    let date = parsed.date().map(|d| d.to_timestamp());

    if message_id.is_none() && from_addr.is_none() && subject.is_none() && date.is_none() {
        bail!("no recognizable headers");
    }

    Ok(NewMessage {
        uid: fetched.uid,
        message_id,
        from_addr,
        to_addr,
        subject,
        received_at: fetched.internal_date.or(date),
    })
}

/// Fetch and store everything above `last_cursor` in the configured folder.
///
/// Never returns an error: connection, parse and store failures all end up
/// in `SyncResult::errors`. The client is disconnected on every path.
pub async fn sync_mailbox(
    pool: &SqlitePool,
    client: &mut dyn MailboxClient,
    account_id: &str,
    config: &MailboxConfig,
    last_cursor: u32,
    known_uid_validity: Option<u32>,
) -> SyncResult {
    let start = std::time::Instant::now();
    let mut result = SyncResult::starting_at(last_cursor);

    if let Err(e) = client.connect(config).await {
        warn!(account_id=%account_id, host=%config.host, error=%e, "mailbox connect failed");
        result.errors.push(e.to_string());
        client.disconnect().await;
        return result;
    }

    if let Err(e) = fetch_and_store(pool, client, account_id, config, known_uid_validity, &mut result).await {
        warn!(account_id=%account_id, error=%e, "incremental sync aborted");
        result.errors.push(format!("{e:#}"));
    }
    client.disconnect().await;

    info!(
        account_id=%account_id,
        new=result.new_count,
        reactivated=result.reactivated_count,
        cursor=result.last_processed_cursor,
        errors=result.errors.len(),
        duration_ms=start.elapsed().as_millis() as u64,
        "incremental sync finished"
    );
    result
}

async fn fetch_and_store(
    pool: &SqlitePool,
    client: &mut dyn MailboxClient,
    account_id: &str,
    config: &MailboxConfig,
    known_uid_validity: Option<u32>,
    result: &mut SyncResult,
) -> Result<()> {
    let folder = client
        .open_folder(&config.folder)
        .await
        .with_context(|| format!("open folder {}", config.folder))?;
    result.uid_validity = folder.uid_validity;

    if let (Some(known), Some(current)) = (known_uid_validity, folder.uid_validity) {
        if known != current {
            // UIDs from the old mailbox generation mean nothing now
            warn!(account_id=%account_id, known, current, "UIDVALIDITY changed, restarting cursor");
            result.last_processed_cursor = 0;
        }
    }

    let since = result.last_processed_cursor;
    let uids = client.uids_above(since).await.context("search new messages")?;
    debug!(account_id=%account_id, since, count=uids.len(), "new UIDs on server");

    let now = now_epoch();
    for chunk in uids.chunks(FETCH_CHUNK) {
        // each batch is stored before the next is fetched, so a later timeout keeps this progress
        let fetched = client.fetch_headers(chunk).await.context("fetch new messages")?;
        for m in fetched.iter().filter(|m| m.uid > since) {
            let msg = match parse_message(m) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(account_id=%account_id, uid=m.uid, error=%e, "skipping malformed message");
                    result.errors.push(format!("uid {}: {e}", m.uid));
                    result.last_processed_cursor = result.last_processed_cursor.max(m.uid);
                    continue;
                }
            };

            // a store failure stops the batch so the cursor never passes an unsaved message
            let outcome = message_store::upsert_message(
                pool,
                account_id,
                &config.folder,
                result.uid_validity,
                &msg,
                now,
            )
            .await
            .with_context(|| format!("store uid {}", m.uid))?;
            match outcome {
                UpsertOutcome::Inserted => result.new_count += 1,
                UpsertOutcome::Reactivated => result.reactivated_count += 1,
                UpsertOutcome::Unchanged => {}
            }
            result.last_processed_cursor = result.last_processed_cursor.max(m.uid);
        }
        // UIDs expunged between search and fetch need no retry
        if let Some(last) = chunk.last() {
            result.last_processed_cursor = result.last_processed_cursor.max(*last);
        }
    }
    Ok(())
}
