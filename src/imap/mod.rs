// Mailbox protocol boundary: the client trait the sync and reconciliation
// services drive, plus the async-imap backed implementation.
pub mod conn;

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};

use crate::error::MailboxResult;
use crate::models::MailboxConfig;

pub use conn::{ImapClientFactory, ImapMailboxClient};

/// UIDs per header FETCH during incremental sync.
pub const FETCH_CHUNK: usize = 50;

/// State reported by SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// A message as fetched off the wire, before header parsing.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Raw RFC 5322 header block.
    pub header: Vec<u8>,
    /// INTERNALDATE as epoch seconds.
    pub internal_date: Option<i64>,
}

/// Identifiers currently present in the selected folder.
///
/// Either set may be `None` when the server does not expose it. `complete`
/// is false whenever the listing was cut short (a stream item failed, a
/// response could not be parsed); such a listing must never drive archiving.
#[derive(Debug, Clone, Default)]
pub struct ServerListing {
    pub uids: Option<BTreeSet<u32>>,
    pub message_ids: Option<HashSet<String>>,
    pub complete: bool,
}

impl ServerListing {
    pub fn incomplete() -> Self {
        Self {
            uids: None,
            message_ids: None,
            complete: false,
        }
    }

    /// Number of messages the listing accounts for.
    pub fn len(&self) -> usize {
        let uids = self.uids.as_ref().map_or(0, |u| u.len());
        let ids = self.message_ids.as_ref().map_or(0, |m| m.len());
        uids.max(ids)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The five operations the engine needs from a mailbox server.
#[async_trait]
pub trait MailboxClient: Send {
    async fn connect(&mut self, config: &MailboxConfig) -> MailboxResult<()>;

    async fn open_folder(&mut self, name: &str) -> MailboxResult<FolderStatus>;

    /// UIDs strictly greater than `since_uid`, ascending.
    async fn uids_above(&mut self, since_uid: u32) -> MailboxResult<Vec<u32>>;

    /// Header blocks for one batch of UIDs. UIDs expunged in the meantime
    /// are simply absent from the result.
    async fn fetch_headers(&mut self, uids: &[u32]) -> MailboxResult<Vec<FetchedMessage>>;

    async fn list_identifiers(&mut self, include_uids: bool) -> MailboxResult<ServerListing>;

    async fn disconnect(&mut self);
}

/// Hands out one fresh client per account visit.
pub trait MailboxClientFactory: Send + Sync {
    fn create(&self) -> Box<dyn MailboxClient>;
}
