#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use inbound_reconciler::error::{MailboxError, MailboxResult};
use inbound_reconciler::imap::{
    FetchedMessage, FolderStatus, MailboxClient, MailboxClientFactory, ServerListing,
};
use inbound_reconciler::models::{MailboxConfig, MailboxConnection, NewConnection};
use inbound_reconciler::secret::Base64Secrets;
use inbound_reconciler::services::registry;

/// One scripted mailbox. `messages` maps UID to an optional Message-ID.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub uid_validity: u32,
    pub messages: BTreeMap<u32, Option<String>>,
    /// UIDs whose header block comes back empty.
    pub broken: BTreeSet<u32>,
    pub fail_connect: bool,
    pub incomplete_listing: bool,
    /// Header fetches that succeed before every further one times out.
    pub fetch_budget: Option<usize>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            uid_validity: 1,
            messages: BTreeMap::new(),
            broken: BTreeSet::new(),
            fail_connect: false,
            incomplete_listing: false,
            fetch_budget: None,
        }
    }
}

impl Mailbox {
    pub fn with(mut self, uid: u32, message_id: &str) -> Self {
        self.messages.insert(uid, Some(message_id.to_string()));
        self
    }

    /// A message without a Message-ID header.
    pub fn anonymous(mut self, uid: u32) -> Self {
        self.messages.insert(uid, None);
        self
    }

    pub fn header(&self, uid: u32) -> Vec<u8> {
        if self.broken.contains(&uid) {
            return Vec::new();
        }
        let mut h = String::new();
        if let Some(Some(mid)) = self.messages.get(&uid) {
            h.push_str(&format!("Message-ID: <{mid}>\r\n"));
        }
        h.push_str("From: Lead <lead@example.org>\r\n");
        h.push_str("To: sales@example.com\r\n");
        h.push_str(&format!("Subject: message {uid}\r\n"));
        h.push_str("Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\r\n");
        h.into_bytes()
    }
}

#[derive(Default)]
pub struct ServerState {
    /// Keyed by host name.
    pub mailboxes: HashMap<String, Mailbox>,
    pub connects: usize,
    pub disconnects: usize,
    pub fetches: usize,
    /// When set, every connect waits for one permit.
    pub gate: Option<Arc<Notify>>,
}

/// In-memory stand-in for a fleet of IMAP servers.
#[derive(Clone, Default)]
pub struct FakeServer(pub Arc<Mutex<ServerState>>);

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, host: &str, mailbox: Mailbox) {
        self.0.lock().unwrap().mailboxes.insert(host.to_string(), mailbox);
    }

    pub fn edit(&self, host: &str, f: impl FnOnce(&mut Mailbox)) {
        let mut state = self.0.lock().unwrap();
        f(state.mailboxes.entry(host.to_string()).or_default());
    }

    pub fn connects(&self) -> usize {
        self.0.lock().unwrap().connects
    }

    pub fn fetches(&self) -> usize {
        self.0.lock().unwrap().fetches
    }

    pub fn disconnects(&self) -> usize {
        self.0.lock().unwrap().disconnects
    }

    pub fn set_gate(&self, gate: Option<Arc<Notify>>) {
        self.0.lock().unwrap().gate = gate;
    }

    pub fn client(&self) -> FakeClient {
        FakeClient {
            server: self.clone(),
            host: None,
        }
    }

    fn mailbox(&self, host: &Option<String>) -> MailboxResult<Mailbox> {
        let host = host.as_ref().ok_or(MailboxError::NotConnected)?;
        self.0
            .lock()
            .unwrap()
            .mailboxes
            .get(host)
            .cloned()
            .ok_or(MailboxError::NotConnected)
    }
}

impl MailboxClientFactory for FakeServer {
    fn create(&self) -> Box<dyn MailboxClient> {
        Box::new(self.client())
    }
}

pub struct FakeClient {
    server: FakeServer,
    host: Option<String>,
}

#[async_trait]
impl MailboxClient for FakeClient {
    async fn connect(&mut self, config: &MailboxConfig) -> MailboxResult<()> {
        let gate = {
            let mut state = self.server.0.lock().unwrap();
            state.connects += 1;
            state.gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let reachable = {
            let state = self.server.0.lock().unwrap();
            matches!(state.mailboxes.get(&config.host), Some(mb) if !mb.fail_connect)
        };
        if !reachable {
            return Err(MailboxError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: "connection refused".into(),
            });
        }
        self.host = Some(config.host.clone());
        Ok(())
    }

    async fn open_folder(&mut self, _name: &str) -> MailboxResult<FolderStatus> {
        let mb = self.server.mailbox(&self.host)?;
        Ok(FolderStatus {
            exists: mb.messages.len() as u32,
            uid_validity: Some(mb.uid_validity),
            uid_next: Some(mb.messages.keys().next_back().map_or(1, |u| u + 1)),
        })
    }

    async fn uids_above(&mut self, since_uid: u32) -> MailboxResult<Vec<u32>> {
        let mb = self.server.mailbox(&self.host)?;
        Ok(mb.messages.range(since_uid + 1..).map(|(uid, _)| *uid).collect())
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> MailboxResult<Vec<FetchedMessage>> {
        let mb = self.server.mailbox(&self.host)?;
        {
            let mut state = self.server.0.lock().unwrap();
            state.fetches += 1;
            if let Some(budget) = mb.fetch_budget {
                if state.fetches > budget {
                    return Err(MailboxError::Timeout {
                        operation: "fetch",
                        secs: 30,
                    });
                }
            }
        }
        Ok(uids
            .iter()
            .filter(|uid| mb.messages.contains_key(uid))
            .map(|uid| FetchedMessage {
                uid: *uid,
                header: mb.header(*uid),
                internal_date: None,
            })
            .collect())
    }

    async fn list_identifiers(&mut self, include_uids: bool) -> MailboxResult<ServerListing> {
        let mb = self.server.mailbox(&self.host)?;
        // a truncated listing only sees the first message
        let take = if mb.incomplete_listing { 1 } else { usize::MAX };
        let uids: BTreeSet<u32> = mb.messages.keys().copied().take(take).collect();
        let message_ids: HashSet<String> = mb
            .messages
            .iter()
            .take(take)
            .filter_map(|(_, mid)| mid.clone())
            .collect();
        Ok(ServerListing {
            uids: include_uids.then_some(uids),
            message_ids: Some(message_ids),
            complete: !mb.incomplete_listing,
        })
    }

    async fn disconnect(&mut self) {
        self.server.0.lock().unwrap().disconnects += 1;
        self.host = None;
    }
}

pub fn new_connection(account_id: &str, host: &str) -> NewConnection {
    NewConnection {
        account_id: account_id.to_string(),
        imap_host: host.to_string(),
        imap_port: 993,
        use_tls: true,
        username: format!("{account_id}@example.com"),
        password: "app-password".into(),
        folder: "INBOX".into(),
        list_uids: true,
        sync_interval_minutes: 15,
    }
}

pub async fn register(pool: &SqlitePool, account_id: &str, host: &str) -> MailboxConnection {
    let new = new_connection(account_id, host);
    let sealed = Base64Secrets::seal(&new.username, &new.password);
    registry::register_connection(pool, &new, &sealed, 0)
        .await
        .unwrap()
}

pub fn config_for(host: &str) -> MailboxConfig {
    MailboxConfig {
        host: host.to_string(),
        port: 993,
        tls: true,
        user: "ops@example.com".into(),
        secret: "app-password".into(),
        folder: "INBOX".into(),
        list_uids: true,
    }
}
