//! Internal storage models for Clipstash
//!
//! Row payloads written by the ingestion pipeline, plus the string codecs used
//! for enum columns and the content hashes.

use chrono::{DateTime, Utc};

use crate::content_detection;
use crate::interface::{EncryptionMode, HistoryEntry, Kind, Offer, OfferRecord};

/// 128-bit content hash of the chosen representation, used as the dedup key
pub fn dedup_hash(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hex::encode(&hash.as_bytes()[..16])
}

/// Full-width per-offer integrity digest
pub fn content_digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

impl Kind {
    pub fn to_database_str(self) -> &'static str {
        match self {
            Kind::Text => "text",
            Kind::Link => "link",
            Kind::Image => "image",
            Kind::Unknown => "unknown",
        }
    }

    pub fn from_database_str(s: &str) -> Self {
        match s {
            "text" => Kind::Text,
            "link" => Kind::Link,
            "image" => Kind::Image,
            _ => Kind::Unknown,
        }
    }
}

impl EncryptionMode {
    pub fn to_database_str(self) -> &'static str {
        match self {
            EncryptionMode::None => "none",
            EncryptionMode::Local => "local",
        }
    }

    pub fn from_database_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(EncryptionMode::None),
            "local" => Some(EncryptionMode::Local),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NEW ROWS (built by the ingestion pipeline, consumed by UnitOfWork)
// ─────────────────────────────────────────────────────────────────────────────

/// A history entry about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub id: String,
    pub dedup_hash: String,
    pub preferred_mime_type: String,
    pub kind: Kind,
    pub offer_count: u32,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NewEntry {
    /// Projection returned to callers once the insert commits
    pub fn to_history_entry(&self, text_preview: String) -> HistoryEntry {
        HistoryEntry {
            id: self.id.clone(),
            dedup_hash: self.dedup_hash.clone(),
            preferred_mime_type: self.preferred_mime_type.clone(),
            kind: self.kind,
            offer_count: self.offer_count,
            text_preview,
            source: self.source.clone(),
            keywords: None,
            pinned_at: None,
            created_at: self.timestamp,
            updated_at: self.timestamp,
        }
    }
}

/// An offer about to be persisted: its metadata row plus the raw bytes for the blob
#[derive(Debug, Clone)]
pub struct NewOffer {
    pub record: OfferRecord,
    pub data: Vec<u8>,
}

impl NewOffer {
    pub fn new(selection_id: &str, offer: Offer, encryption: EncryptionMode) -> Self {
        let kind = content_detection::classify_kind(&offer.mime_type, &offer.data);
        let url_host = if kind == Kind::Link {
            content_detection::url_host(&offer.data)
        } else {
            None
        };
        let record = OfferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            selection_id: selection_id.to_string(),
            text_preview: content_detection::text_preview(&offer.mime_type, &offer.data),
            content_digest: content_digest(&offer.data),
            encryption,
            byte_size: offer.data.len() as u64,
            url_host,
            mime_type: offer.mime_type,
        };
        Self {
            record,
            data: offer.data,
        }
    }
}
