pub mod config;
pub mod db;
pub mod error;
pub mod imap;
pub mod models;
pub mod routes;
pub mod secret;
pub mod services;
pub mod telemetry;
