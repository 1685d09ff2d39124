/// Credential access for live mailbox connections
use base64::Engine;

use crate::error::MailboxError;
use crate::models::{MailboxConfig, MailboxConnection};

/// Turns a stored connection row into live connection parameters.
///
/// A decode failure is a hard connectivity error: the stored blob is never
/// used as a plaintext password.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, connection: &MailboxConnection) -> Result<MailboxConfig, MailboxError>;
}

/// Base64 encoded `user:password` blobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Secrets;

impl Base64Secrets {
    pub fn seal(user: &str, password: &str) -> String {
        let creds = format!("{}:{}", user, password);
        base64::engine::general_purpose::STANDARD.encode(creds.as_bytes())
    }

    pub fn open(encoded: &str) -> Result<(String, String), MailboxError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| MailboxError::Secret(format!("not base64: {e}")))?;
        let creds = String::from_utf8(decoded)
            .map_err(|_| MailboxError::Secret("not valid UTF-8".into()))?;
        match creds.split_once(':') {
            Some((user, password)) if !password.is_empty() => {
                Ok((user.to_string(), password.to_string()))
            }
            _ => Err(MailboxError::Secret("invalid credentials format".into())),
        }
    }
}

impl SecretResolver for Base64Secrets {
    fn resolve(&self, connection: &MailboxConnection) -> Result<MailboxConfig, MailboxError> {
        let (stored_user, secret) = Self::open(&connection.credentials_encrypted)?;
        let user = if connection.username.is_empty() {
            stored_user
        } else {
            connection.username.clone()
        };
        Ok(MailboxConfig {
            host: connection.imap_host.clone(),
            port: connection.imap_port,
            tls: connection.use_tls,
            user,
            secret,
            folder: connection.folder.clone(),
            list_uids: connection.list_uids,
        })
    }
}
