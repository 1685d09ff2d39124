pub mod connection;
pub mod message;

pub use connection::{ConnectionStatus, MailboxConfig, MailboxConnection, NewConnection};
pub use message::{normalize_message_id, NewMessage, StoredMessage};
