/// Mailbox connection models: per-account inbound sync state
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Connecting,
    Error,
}

impl ConnectionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "connecting" => Some(Self::Connecting),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Connecting => "connecting",
            Self::Error => "error",
        }
    }
}

/// One row of `mailbox_connections`.
///
/// Mutated only through `services::registry`, one UPDATE per transition so
/// status, cursor, failure count and next-due time always change together.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MailboxConnection {
    pub account_id: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub use_tls: bool,
    pub username: String,
    #[serde(skip_serializing)]
    pub credentials_encrypted: String,
    pub folder: String,
    pub list_uids: bool,
    pub sync_interval_minutes: i64,
    /// Highest processed UID, 0 when the folder was never synced.
    pub last_cursor: u32,
    pub uid_validity: Option<u32>,
    pub status: ConnectionStatus,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub total_messages_processed: i64,
    pub last_attempt_at: Option<i64>,
    pub last_successful_connection_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_full_reconciliation_at: Option<i64>,
    pub next_sync_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MailboxConnection {
    pub fn has_host(&self) -> bool {
        !self.imap_host.trim().is_empty()
    }

    pub fn sync_interval_secs(&self) -> i64 {
        self.sync_interval_minutes.max(1) * 60
    }
}

/// Input for registering a new connection.
#[derive(Clone, Deserialize)]
pub struct NewConnection {
    pub account_id: String,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    pub username: String,
    pub password: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_true")]
    pub list_uids: bool,
    #[serde(default = "default_interval")]
    pub sync_interval_minutes: i64,
}

fn default_imap_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_interval() -> i64 {
    15
}

/// Live connection parameters, produced by a `SecretResolver`.
#[derive(Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub user: String,
    pub secret: String,
    pub folder: String,
    /// Ask the server for the UID set as a fallback reconciliation key.
    pub list_uids: bool,
}

impl fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .field("folder", &self.folder)
            .field("list_uids", &self.list_uids)
            .finish()
    }
}
