use async_imap::Session;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls::TlsConnector;
use tracing::{debug, warn};

use super::{FetchedMessage, FolderStatus, MailboxClient, MailboxClientFactory, ServerListing};
use crate::error::{MailboxError, MailboxResult};
use crate::models::{normalize_message_id, MailboxConfig};

/// Transport under the IMAP session: plain TCP or TLS, boxed so both share one session type.
pub trait ImapIo: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}
impl<T> ImapIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

type ImapSession = Session<Box<dyn ImapIo>>;

const FETCH_NEW: &str = "(UID INTERNALDATE BODY.PEEK[HEADER])";
const FETCH_IDS: &str = "(UID ENVELOPE)";

/// UIDs per ENVELOPE FETCH while listing a whole folder.
const LIST_CHUNK: usize = 500;

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Running state of a folder-wide ENVELOPE listing.
#[derive(Debug)]
struct ListingTally {
    ids: HashSet<String>,
    seen: usize,
    complete: bool,
}

impl ListingTally {
    fn new() -> Self {
        Self {
            ids: HashSet::new(),
            seen: 0,
            complete: true,
        }
    }

    /// `None` for a FETCH item without ENVELOPE, `Some(None)` for a NIL Message-ID.
    fn record(&mut self, entry: Option<Option<&[u8]>>) {
        let Some(message_id) = entry else {
            // the message exists but cannot be identified
            self.complete = false;
            return;
        };
        self.seen += 1;
        if let Some(mid) = message_id
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(normalize_message_id)
        {
            self.ids.insert(mid);
        }
    }

    fn finish(mut self, uids: BTreeSet<u32>, expected: usize, include_uids: bool) -> ServerListing {
        if self.complete && self.seen < expected {
            warn!(seen = self.seen, expected, "identifier listing shorter than uid search");
            self.complete = false;
        }
        ServerListing {
            uids: include_uids.then_some(uids),
            message_ids: Some(self.ids),
            complete: self.complete,
        }
    }
}

async fn with_timeout<F, T>(limit: Duration, operation: &'static str, fut: F) -> MailboxResult<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MailboxError::Timeout {
            operation,
            secs: limit.as_secs(),
        })
}

/// async-imap backed client. Every network round-trip is bounded by `timeout`.
pub struct ImapMailboxClient {
    session: Option<ImapSession>,
    selected: Option<FolderStatus>,
    timeout: Duration,
}

impl ImapMailboxClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            session: None,
            selected: None,
            timeout,
        }
    }

    async fn open_stream(&self, config: &MailboxConfig) -> MailboxResult<Box<dyn ImapIo>> {
        let tcp = with_timeout(
            self.timeout,
            "connect",
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await?
        .map_err(|e| MailboxError::Connect {
            host: config.host.clone(),
            port: config.port,
            reason: e.to_string(),
        })?;

        if !config.tls {
            return Ok(Box::new(tcp));
        }

        let tls = TlsConnector::builder().build().map_err(|e| MailboxError::Tls {
            host: config.host.clone(),
            reason: e.to_string(),
        })?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let tls_stream = with_timeout(self.timeout, "tls handshake", tls.connect(&config.host, tcp))
            .await?
            .map_err(|e| MailboxError::Tls {
                host: config.host.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(tls_stream))
    }

    fn session(&mut self) -> MailboxResult<&mut ImapSession> {
        self.session.as_mut().ok_or(MailboxError::NotConnected)
    }
}

#[async_trait]
impl MailboxClient for ImapMailboxClient {
    async fn connect(&mut self, config: &MailboxConfig) -> MailboxResult<()> {
        let stream = self.open_stream(config).await?;
        let client = async_imap::Client::new(stream);
        let session = with_timeout(self.timeout, "login", client.login(&config.user, &config.secret))
            .await?
            .map_err(|(e, _)| MailboxError::Auth {
                user: config.user.clone(),
                reason: e.to_string(),
            })?;
        debug!(host=%config.host, port=config.port, tls=config.tls, "imap session established");
        self.session = Some(session);
        self.selected = None;
        Ok(())
    }

    async fn open_folder(&mut self, name: &str) -> MailboxResult<FolderStatus> {
        let limit = self.timeout;
        let session = self.session()?;
        let mailbox = with_timeout(limit, "select", session.select(name))
            .await?
            .map_err(|e| MailboxError::Folder {
                folder: name.to_string(),
                reason: e.to_string(),
            })?;
        let status = FolderStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
        };
        self.selected = Some(status);
        Ok(status)
    }

    async fn uids_above(&mut self, since_uid: u32) -> MailboxResult<Vec<u32>> {
        let limit = self.timeout;
        let session = self.session()?;
        // `N:*` always matches the highest UID, even when it is below N
        let query = format!("UID {}:*", since_uid.saturating_add(1));
        let found = with_timeout(limit, "uid search", session.uid_search(&query)).await??;
        let mut uids: Vec<u32> = found.into_iter().filter(|u| *u > since_uid).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> MailboxResult<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let limit = self.timeout;
        let session = self.session()?;
        let uid_set = uid_set(uids);
        with_timeout(limit, "fetch", async {
            let mut stream = session.uid_fetch(&uid_set, FETCH_NEW).await?;
            let mut out = Vec::with_capacity(uids.len());
            while let Some(item) = stream.next().await {
                let f = item?;
                let Some(uid) = f.uid else { continue };
                out.push(FetchedMessage {
                    uid,
                    header: f.header().map(|h| h.to_vec()).unwrap_or_default(),
                    internal_date: f.internal_date().map(|d| d.timestamp()),
                });
            }
            out.sort_by_key(|m| m.uid);
            Ok::<_, MailboxError>(out)
        })
        .await?
    }

    async fn list_identifiers(&mut self, include_uids: bool) -> MailboxResult<ServerListing> {
        let limit = self.timeout;
        let exists = self.selected.map(|s| s.exists).unwrap_or(0);
        let session = self.session()?;

        let found = with_timeout(limit, "uid search", session.uid_search("ALL")).await??;
        let uids: BTreeSet<u32> = found.into_iter().collect();
        let all: Vec<u32> = uids.iter().copied().collect();

        let mut tally = ListingTally::new();
        if (all.len() as u64) < exists as u64 {
            warn!(uids = all.len(), exists, "uid search shorter than folder");
            tally.complete = false;
        }

        for chunk in all.chunks(LIST_CHUNK) {
            if !tally.complete {
                break;
            }
            let uid_set = uid_set(chunk);
            // one deadline per batch
            with_timeout(limit, "identifier listing", async {
                let mut stream = session.uid_fetch(&uid_set, FETCH_IDS).await?;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(f) => {
                            let entry = f.envelope().map(|e| e.message_id.as_deref());
                            if entry.is_none() {
                                warn!(uid = ?f.uid, "FETCH item without ENVELOPE");
                            }
                            tally.record(entry);
                        }
                        Err(e) => {
                            warn!(error=%e, "identifier listing interrupted");
                            tally.complete = false;
                        }
                    }
                    if !tally.complete {
                        break;
                    }
                }
                Ok::<_, MailboxError>(())
            })
            .await??;
        }

        let listing = tally.finish(uids, all.len(), include_uids);
        debug!(
            uids = all.len(),
            message_ids = listing.message_ids.as_ref().map_or(0, |m| m.len()),
            complete = listing.complete,
            "server listing collected"
        );
        Ok(listing)
    }

    async fn disconnect(&mut self) {
        self.selected = None;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = with_timeout(self.timeout, "logout", session.logout()).await {
                debug!(error=%e, "imap logout did not complete");
            }
        }
    }
}

/// Builds `ImapMailboxClient`s sharing one network timeout.
#[derive(Debug, Clone)]
pub struct ImapClientFactory {
    pub timeout: Duration,
}

impl ImapClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl MailboxClientFactory for ImapClientFactory {
    fn create(&self) -> Box<dyn MailboxClient> {
        Box::new(ImapMailboxClient::new(self.timeout))
    }
}
