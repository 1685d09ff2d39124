/// Local replica of inbound mail
use anyhow::Result;
use sqlx::SqlitePool;

use crate::models::{NewMessage, StoredMessage};

const MESSAGE_COLUMNS: &str = "id, account_id, folder, uid, uid_validity, message_id, from_addr, to_addr, subject, \
     received_at, classification_state, processing_state, archived_at";

/// SQLite caps bound parameters per statement; stay well below it.
const ARCHIVE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A previously archived copy became active again.
    Reactivated,
    /// Already stored and active; only bookkeeping columns touched.
    Unchanged,
}

/// Idempotent insert keyed on `(account, message_id)`, or on
/// `(account, folder, uid_validity, uid)` for messages without a Message-ID.
///
/// A UID is only an identity within one UIDVALIDITY generation, so a
/// reused UID after a validity change is stored as a new message.
pub async fn upsert_message(
    pool: &SqlitePool,
    account_id: &str,
    folder: &str,
    uid_validity: Option<u32>,
    msg: &NewMessage,
    now: i64,
) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;

    let existing: Option<(i64, Option<i64>)> = match &msg.message_id {
        Some(mid) => {
            sqlx::query_as(
                "SELECT id, archived_at FROM messages WHERE account_id = ? AND message_id = ? \
                 ORDER BY archived_at IS NOT NULL, id DESC LIMIT 1",
            )
            .bind(account_id)
            .bind(mid)
            .fetch_optional(&mut *tx)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT id, archived_at FROM messages \
                 WHERE account_id = ? AND folder = ? AND uid = ? AND uid_validity IS ? \
                   AND message_id IS NULL \
                 ORDER BY archived_at IS NOT NULL, id DESC LIMIT 1",
            )
            .bind(account_id)
            .bind(folder)
            .bind(msg.uid)
            .bind(uid_validity)
            .fetch_optional(&mut *tx)
            .await?
        }
    };

    let outcome = match existing {
        Some((id, archived_at)) => {
            sqlx::query(
                "UPDATE messages SET uid = ?, uid_validity = ?, folder = ?, archived_at = NULL, \
                 synced_at = ? WHERE id = ?",
            )
            .bind(msg.uid)
            .bind(uid_validity)
            .bind(folder)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if archived_at.is_some() {
                UpsertOutcome::Reactivated
            } else {
                UpsertOutcome::Unchanged
            }
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO messages (
                    account_id, folder, uid, uid_validity, message_id,
                    from_addr, to_addr, subject, received_at,
                    synced_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(account_id)
            .bind(folder)
            .bind(msg.uid)
            .bind(uid_validity)
            .bind(&msg.message_id)
            .bind(&msg.from_addr)
            .bind(&msg.to_addr)
            .bind(&msg.subject)
            .bind(msg.received_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            UpsertOutcome::Inserted
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

/// Non-archived messages of one account folder.
pub async fn find_active_messages(
    pool: &SqlitePool,
    account_id: &str,
    folder: &str,
) -> Result<Vec<StoredMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE account_id = ? AND folder = ? AND archived_at IS NULL ORDER BY uid"
    );
    let rows = sqlx::query_as::<_, StoredMessage>(&sql)
        .bind(account_id)
        .bind(folder)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Every stored copy (active or archived) carrying `message_id`.
pub async fn find_by_message_id(
    pool: &SqlitePool,
    account_id: &str,
    message_id: &str,
) -> Result<Vec<StoredMessage>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? AND message_id = ? ORDER BY id"
    );
    let rows = sqlx::query_as::<_, StoredMessage>(&sql)
        .bind(account_id)
        .bind(message_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Archive the given rows in one transaction. Already archived rows keep
/// their original timestamp. Returns the number of rows archived.
pub async fn archive_by_ids(pool: &SqlitePool, ids: &[i64], now: i64) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut archived = 0;
    for chunk in ids.chunks(ARCHIVE_CHUNK) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE messages SET archived_at = ? WHERE archived_at IS NULL AND id IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql).bind(now);
        for id in chunk {
            q = q.bind(id);
        }
        archived += q.execute(&mut *tx).await?.rows_affected();
    }
    tx.commit().await?;
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn msg(uid: u32, mid: Option<&str>) -> NewMessage {
        NewMessage {
            uid,
            message_id: mid.map(str::to_string),
            from_addr: Some("lead@example.org".into()),
            to_addr: Some("sales@example.com".into()),
            subject: Some("Re: intro".into()),
            received_at: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_message_id() {
        let pool = db::connect_memory().await.unwrap();
        let first = upsert_message(&pool, "acc", "INBOX", Some(1), &msg(7, Some("a@x")), 10)
            .await
            .unwrap();
        let again = upsert_message(&pool, "acc", "INBOX", Some(1), &msg(9, Some("a@x")), 20)
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(again, UpsertOutcome::Unchanged);

        let rows = find_by_message_id(&pool, "acc", "a@x").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uid, 9);
    }

    #[tokio::test]
    async fn messages_without_id_key_on_uid() {
        let pool = db::connect_memory().await.unwrap();
        upsert_message(&pool, "acc", "INBOX", Some(1), &msg(3, None), 10).await.unwrap();
        let again = upsert_message(&pool, "acc", "INBOX", Some(1), &msg(3, None), 11).await.unwrap();
        upsert_message(&pool, "acc", "INBOX", Some(1), &msg(4, None), 11).await.unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged);
        let active = find_active_messages(&pool, "acc", "INBOX").await.unwrap();
        assert_eq!(active.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn archive_then_reactivate() {
        let pool = db::connect_memory().await.unwrap();
        upsert_message(&pool, "acc", "INBOX", Some(1), &msg(1, Some("b@x")), 10).await.unwrap();
        let active = find_active_messages(&pool, "acc", "INBOX").await.unwrap();
        let ids: Vec<i64> = active.iter().map(|m| m.id).collect();

        assert_eq!(archive_by_ids(&pool, &ids, 50).await.unwrap(), 1);
        // second archive is a no-op and keeps the first timestamp
        assert_eq!(archive_by_ids(&pool, &ids, 60).await.unwrap(), 0);
        let rows = find_by_message_id(&pool, "acc", "b@x").await.unwrap();
        assert_eq!(rows[0].archived_at, Some(50));

        let outcome = upsert_message(&pool, "acc", "INBOX", Some(1), &msg(1, Some("b@x")), 70)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Reactivated);
        let rows = find_by_message_id(&pool, "acc", "b@x").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_active());
    }

    #[tokio::test]
    async fn accounts_are_isolated() {
        let pool = db::connect_memory().await.unwrap();
        upsert_message(&pool, "a", "INBOX", Some(1), &msg(1, Some("same@x")), 1).await.unwrap();
        let other = upsert_message(&pool, "b", "INBOX", Some(1), &msg(1, Some("same@x")), 1)
            .await
            .unwrap();
        assert_eq!(other, UpsertOutcome::Inserted);
        assert!(find_active_messages(&pool, "a", "Archive").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reused_uid_under_new_validity_is_a_new_message() {
        let pool = db::connect_memory().await.unwrap();
        upsert_message(&pool, "acc", "INBOX", Some(1), &msg(3, None), 10).await.unwrap();

        let mut newer = msg(3, None);
        newer.subject = Some("different mail".into());
        let outcome = upsert_message(&pool, "acc", "INBOX", Some(2), &newer, 20).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let active = find_active_messages(&pool, "acc", "INBOX").await.unwrap();
        assert_eq!(active.len(), 2);
        let fresh = active.iter().find(|m| m.uid_validity == Some(2)).unwrap();
        assert_eq!(fresh.subject.as_deref(), Some("different mail"));
    }
}
