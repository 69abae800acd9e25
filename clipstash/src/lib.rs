//! Clipstash Core - persistent, encrypted clipboard history
//!
//! Captures clipboard selections, deduplicates them by content, stores each
//! payload as its own (optionally AES-256-GCM sealed) file and serves paginated,
//! searchable history from SQLite.

pub mod blob_store;
pub mod config;
pub mod content_detection;
pub mod crypto;
pub mod database;
pub mod interface;
pub mod keystore;
pub mod models;
pub mod placement;
mod store;

pub use config::EngineConfig;
pub use interface::*;
pub use keystore::{KeyProvider, MemoryKeystore, SecretStore, SystemKeyring};
pub use placement::{ClipboardContent, CopyOptions};
pub use store::ClipboardEngine;
