//! Error types for the mailbox protocol boundary.

use thiserror::Error;

/// Errors produced while talking to a mailbox server.
#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("TLS negotiation with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    #[error("login failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("cannot open folder {folder}: {reason}")]
    Folder { folder: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    /// Stored credentials could not be decoded into a usable secret.
    #[error("credentials unusable: {0}")]
    Secret(String),

    #[error("not connected")]
    NotConnected,
}

impl From<async_imap::error::Error> for MailboxError {
    fn from(e: async_imap::error::Error) -> Self {
        MailboxError::Protocol(e.to_string())
    }
}

pub type MailboxResult<T> = std::result::Result<T, MailboxError>;
