//! Clipstash public interface
//!
//! Shared types handed to callers of [`crate::ClipboardEngine`]: the transient
//! selection values delivered by the clipboard listener, the persisted history
//! projections, notifications, and the caller-facing error type.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::content_detection;

/// Internal marker offer: selections carrying it are never persisted.
pub const CONCEALED_MIME_TYPE: &str = "application/x-clipstash-concealed";

/// Password-manager hint used by KDE (set by KeePassXC and friends).
pub const KDE_PASSWORD_HINT_MIME_TYPE: &str = "x-kde-passwordManagerHint";

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMS
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse semantic classification of clipboard content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Text,
    Link,
    Image,
    Unknown,
}

impl Kind {
    /// Only text-like kinds get a full-text index row
    pub fn is_indexable(self) -> bool {
        matches!(self, Kind::Text | Kind::Link)
    }
}

/// How an offer's blob is stored at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    Local,
}

/// Whether the key provider has resolved yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Readiness {
    Pending,
    Ready { encrypted: bool },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Why a selection was dropped without touching the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MonitoringDisabled,
    Empty,
    Concealed,
    Unsupported,
}

/// Result of a single ingestion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// A new history entry was committed
    Inserted(HistoryEntry),
    /// Same content already stored; its recency was refreshed
    BubbledUp { id: String },
    /// Held until the encryption key resolves
    Queued,
    Skipped(SkipReason),
}

/// Notifications broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    EntryInserted { entry: HistoryEntry },
    EntryRemoved { id: String },
    AllEntriesRemoved,
    PinChanged { id: String, pinned: bool },
    MonitoringChanged { enabled: bool },
    EncryptionResolved { encrypted: bool },
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS (Structs)
// ═══════════════════════════════════════════════════════════════════════════════

/// One MIME-typed representation within a selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Offer {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn is_concealed_marker(&self) -> bool {
        self.mime_type == CONCEALED_MIME_TYPE || self.mime_type == KDE_PASSWORD_HINT_MIME_TYPE
    }
}

/// One clipboard capture event: ordered offers plus the originating app
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    pub offers: Vec<Offer>,
    pub source_app: Option<String>,
}

impl Selection {
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            offers,
            source_app: None,
        }
    }

    pub fn with_source(mut self, source_app: impl Into<String>) -> Self {
        self.source_app = Some(source_app.into());
        self
    }

    /// Single `text/plain` selection
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![Offer::new("text/plain", text.into().into_bytes())])
    }

    /// MIME type to advertise when placing this selection back on the clipboard
    pub fn preferred_mime_type(&self) -> Option<&str> {
        content_detection::preferred_mime_type(&self.offers)
    }
}

/// Durable projection of a persisted selection, used for list display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub dedup_hash: String,
    pub preferred_mime_type: String,
    pub kind: Kind,
    pub offer_count: u32,
    pub text_preview: String,
    pub source: Option<String>,
    pub keywords: Option<String>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn is_pinned(&self) -> bool {
        self.pinned_at.is_some()
    }
}

/// Metadata of one persisted offer; its bytes live in the blob store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferRecord {
    pub id: String,
    pub selection_id: String,
    pub mime_type: String,
    pub text_preview: String,
    pub content_digest: String,
    pub encryption: EncryptionMode,
    pub byte_size: u64,
    pub url_host: Option<String>,
}

/// Filters for [`crate::ClipboardEngine::list_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilters {
    /// Prefix match over indexed content, substring match over keywords
    pub query: Option<String>,
    pub kind: Option<Kind>,
    pub pinned_only: bool,
}

impl ListFilters {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn kind(kind: Kind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }
}

/// One page of a paginated listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    /// Offset to request the following page, if any
    pub next_offset: Option<usize>,
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, total_count: u64, offset: usize) -> Self {
        let end = offset.saturating_add(items.len());
        let next_offset = if !items.is_empty() && (end as u64) < total_count {
            Some(end)
        } else {
            None
        };
        Self {
            items,
            total_count,
            next_offset,
        }
    }
}

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Blob store error: {0}")]
    Blob(String),
    #[error("Encryption error: {0}")]
    Crypto(String),
    #[error("Keystore error: {0}")]
    Keystore(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Integrity violation: {0}")]
    Integrity(String),
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<crate::database::DatabaseError> for EngineError {
    fn from(e: crate::database::DatabaseError) -> Self {
        if e.is_constraint_violation() {
            EngineError::Integrity(e.to_string())
        } else {
            EngineError::Database(e.to_string())
        }
    }
}

impl From<crate::blob_store::BlobError> for EngineError {
    fn from(e: crate::blob_store::BlobError) -> Self {
        EngineError::Blob(e.to_string())
    }
}

impl From<crate::crypto::CryptoError> for EngineError {
    fn from(e: crate::crypto::CryptoError) -> Self {
        EngineError::Crypto(e.to_string())
    }
}

impl From<crate::keystore::KeystoreError> for EngineError {
    fn from(e: crate::keystore::KeystoreError) -> Self {
        EngineError::Keystore(e.to_string())
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(e: crate::config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_next_offset() {
        let page = Page::new(vec![1, 2], 5, 0);
        assert_eq!(page.next_offset, Some(2));

        let last = Page::new(vec![5], 5, 4);
        assert_eq!(last.next_offset, None);

        let empty: Page<i32> = Page::new(vec![], 5, 10);
        assert_eq!(empty.next_offset, None);

        let far: Page<i32> = Page::new(vec![1], u64::MAX, usize::MAX);
        assert_eq!(far.next_offset, Some(usize::MAX));
    }

    #[test]
    fn test_concealed_markers() {
        assert!(Offer::new(CONCEALED_MIME_TYPE, b"1".to_vec()).is_concealed_marker());
        assert!(Offer::new(KDE_PASSWORD_HINT_MIME_TYPE, b"secret".to_vec()).is_concealed_marker());
        assert!(!Offer::new("text/plain", b"1".to_vec()).is_concealed_marker());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::PinChanged { id: "abc".into(), pinned: true };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "pinChanged");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["pinned"], true);
    }
}
