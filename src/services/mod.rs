pub mod backoff;
pub mod message_store;
pub mod message_sync_service;
pub mod reconcile_service;
pub mod registry;
pub mod scheduler;
