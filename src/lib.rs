//! HomeMatic CCU event bridge
//!
//! Subscribes to one or more CCU interfaces over XML-RPC, receives their
//! event callbacks, filters them against an allow-list and keeps the latest
//! value per `(device, parameter)` in a durable store.
//!
//! # Features
//!
//! - Concurrent `init` subscription with bounded exponential backoff
//! - Shared or per-interface callback listeners (`axum`)
//! - `system.multicall`, device announcement and introspection methods
//! - SQLite (`sqlx`) or in-memory state store with per-key ordering
//! - systemd `sd_notify` readiness and watchdog integration

pub mod bridge;
pub mod config;
pub mod error;
pub mod filter;
pub mod liveness;
pub mod logging;
pub mod registration;
pub mod server;
pub mod store;
pub mod xmlrpc;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
