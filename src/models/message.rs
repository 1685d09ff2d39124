use serde::{Deserialize, Serialize};

/// A stored inbound message row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub account_id: String,
    pub folder: String,
    pub uid: u32,
    pub uid_validity: Option<u32>,
    pub message_id: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<i64>,
    pub classification_state: String,
    pub processing_state: String,
    pub archived_at: Option<i64>,
}

impl StoredMessage {
    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }
}

/// Parsed message ready for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<i64>,
}

/// Canonical form of a Message-ID header value: surrounding whitespace and
/// angle brackets stripped. Empty ids are treated as missing.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(['<', '>']).trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
