//! SQLite metadata store for clipboard history
//!
//! Schema: `selections` (one row per history entry, unique dedup hash), `offers`
//! (one row per persisted representation, cascading from its selection) and the
//! `selection_fts` FTS5 table for text and link content.
//! Uses r2d2 connection pooling so list/retrieve queries never wait on each other.
//! All ingestion writes go through [`Database::write_transaction`].

use crate::interface::{EncryptionMode, HistoryEntry, Kind, ListFilters, OfferRecord};
use crate::models::{NewEntry, NewOffer};
use chrono::{DateTime, TimeZone, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl DatabaseError {
    /// UNIQUE / FOREIGN KEY / NOT NULL violations
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

fn format_db_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse timestamp string from database to DateTime<Utc>
fn parse_db_timestamp(timestamp_str: &str) -> DateTime<Utc> {
    chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S"))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .unwrap_or_else(|_| Utc::now())
}

/// Turn free text into an FTS5 prefix query: every token quoted, implicit AND
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Metadata and blob ids detached by a delete, for the caller to clean up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovedEntries {
    pub selection_ids: Vec<String>,
    pub blob_ids: Vec<String>,
}

impl RemovedEntries {
    pub fn is_empty(&self) -> bool {
        self.selection_ids.is_empty()
    }
}

const ENTRY_COLUMNS: &str = r#"s.id, s.dedupHash, s.preferredMimeType, s.kind, s.offerCount, s.source,
    s.keywords, s.pinnedAt, s.createdAt, s.updatedAt,
    COALESCE((SELECT o.textPreview FROM offers o WHERE o.selectionId = s.id
              ORDER BY (o.mimeType = s.preferredMimeType) DESC, o.rowid LIMIT 1), '')"#;

const ENTRY_ORDER: &str = "ORDER BY (s.pinnedAt IS NULL), s.pinnedAt DESC, s.recency DESC";

const OFFER_COLUMNS: &str =
    "id, selectionId, mimeType, textPreview, contentDigest, encryption, byteSize, urlHost";

/// Single-writer unit of work wrapping one IMMEDIATE transaction.
///
/// Dropping it without [`Database::write_transaction`] committing rolls back
/// every statement issued through it.
pub struct UnitOfWork<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl UnitOfWork<'_> {
    fn next_recency(&self) -> DatabaseResult<i64> {
        let recency: i64 = self.tx.query_row(
            "SELECT COALESCE(MAX(recency), 0) + 1 FROM selections",
            [],
            |row| row.get(0),
        )?;
        Ok(recency)
    }

    /// Refresh recency of the entry with this hash. Returns its id if it exists.
    pub fn try_bubble_up(&self, dedup_hash: &str, now: DateTime<Utc>) -> DatabaseResult<Option<String>> {
        let existing: Option<String> = self
            .tx
            .query_row(
                "SELECT id FROM selections WHERE dedupHash = ?1",
                [dedup_hash],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = existing else {
            return Ok(None);
        };

        let recency = self.next_recency()?;
        self.tx.execute(
            "UPDATE selections SET updatedAt = ?1, recency = ?2 WHERE id = ?3",
            params![format_db_timestamp(now), recency, id],
        )?;
        Ok(Some(id))
    }

    pub fn insert_entry(&self, entry: &NewEntry) -> DatabaseResult<()> {
        let recency = self.next_recency()?;
        let timestamp = format_db_timestamp(entry.timestamp);
        self.tx.execute(
            r#"INSERT INTO selections (id, dedupHash, preferredMimeType, kind, offerCount, source, keywords, pinnedAt, createdAt, updatedAt, recency)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?7, ?8)"#,
            params![
                entry.id,
                entry.dedup_hash,
                entry.preferred_mime_type,
                entry.kind.to_database_str(),
                entry.offer_count,
                entry.source,
                timestamp,
                recency,
            ],
        )?;
        Ok(())
    }

    pub fn insert_offer(&self, offer: &NewOffer) -> DatabaseResult<()> {
        let record = &offer.record;
        self.tx.execute(
            &format!("INSERT INTO offers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", OFFER_COLUMNS),
            params![
                record.id,
                record.selection_id,
                record.mime_type,
                record.text_preview,
                record.content_digest,
                record.encryption.to_database_str(),
                record.byte_size as i64,
                record.url_host,
            ],
        )?;
        Ok(())
    }

    /// Full-text index row for text and link entries
    pub fn index_content(&self, selection_id: &str, content: &[u8]) -> DatabaseResult<()> {
        self.tx.execute(
            "INSERT INTO selection_fts (selectionId, content) VALUES (?1, ?2)",
            params![selection_id, String::from_utf8_lossy(content)],
        )?;
        Ok(())
    }

    /// Delete the oldest unpinned entries so at most `max_entries` remain.
    /// `protected_id` (the entry just inserted) is never chosen.
    pub fn prune_unpinned_beyond(&self, max_entries: usize, protected_id: &str) -> DatabaseResult<RemovedEntries> {
        let total: i64 = self
            .tx
            .query_row("SELECT COUNT(*) FROM selections", [], |row| row.get(0))?;
        let excess = total - max_entries as i64;
        if excess <= 0 {
            return Ok(RemovedEntries::default());
        }

        let mut stmt = self.tx.prepare(
            "SELECT id FROM selections WHERE pinnedAt IS NULL AND id != ?2 ORDER BY recency ASC LIMIT ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![excess, protected_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut removed = RemovedEntries::default();
        for id in ids {
            removed.blob_ids.extend(delete_selection(&self.tx, &id)?);
            removed.selection_ids.push(id);
        }
        Ok(removed)
    }
}

/// Delete one selection and its FTS row; offers cascade. Returns the offer ids.
fn delete_selection(conn: &rusqlite::Connection, id: &str) -> DatabaseResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM offers WHERE selectionId = ?1")?;
    let blob_ids: Vec<String> = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    conn.execute("DELETE FROM selection_fts WHERE selectionId = ?1", [id])?;
    conn.execute("DELETE FROM selections WHERE id = ?1", [id])?;
    Ok(blob_ids)
}

/// Thread-safe database wrapper using connection pooling
///
/// WAL mode enables readers to proceed while the single writer holds its
/// IMMEDIATE transaction.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open or create a database at the given path with connection pooling
    pub fn open<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;
                ",
            )?;
            Ok(())
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys=ON;")?;
            Ok(())
        });

        // In-memory needs single connection to maintain state
        let pool = Pool::builder().max_size(1).build(manager)?;

        let db = Self { pool };
        db.setup_schema()?;
        Ok(db)
    }

    /// Get a connection from the pool
    pub(crate) fn get_conn(&self) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn setup_schema(&self) -> DatabaseResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS selections (
                id TEXT PRIMARY KEY,
                dedupHash TEXT NOT NULL UNIQUE,
                preferredMimeType TEXT NOT NULL,
                kind TEXT NOT NULL,
                offerCount INTEGER NOT NULL,
                source TEXT,
                keywords TEXT,
                pinnedAt TEXT,
                createdAt TEXT NOT NULL,
                updatedAt TEXT NOT NULL,
                recency INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS offers (
                id TEXT PRIMARY KEY,
                selectionId TEXT NOT NULL REFERENCES selections(id) ON DELETE CASCADE,
                mimeType TEXT NOT NULL,
                textPreview TEXT NOT NULL,
                contentDigest TEXT NOT NULL,
                encryption TEXT NOT NULL,
                byteSize INTEGER NOT NULL,
                urlHost TEXT
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS selection_fts USING fts5(
                selectionId UNINDEXED,
                content
            );

            CREATE INDEX IF NOT EXISTS idx_selections_recency ON selections(recency);
            CREATE INDEX IF NOT EXISTS idx_offers_selection ON offers(selectionId);
        "#,
        )?;

        Ok(())
    }

    /// Run `work` inside one IMMEDIATE transaction; commit only if it returns Ok.
    pub fn write_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&UnitOfWork<'_>) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DatabaseError::from)?;
        let uow = UnitOfWork { tx };

        let value = work(&uow)?;
        uow.tx.commit().map_err(DatabaseError::from)?;
        Ok(value)
    }

    /// Get total number of history entries
    pub fn count_entries(&self) -> DatabaseResult<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM selections", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Paginated listing, pinned first then most recent. Returns (page, total matching).
    pub fn list_entries(
        &self,
        limit: usize,
        offset: usize,
        filters: &ListFilters,
    ) -> DatabaseResult<(Vec<HistoryEntry>, u64)> {
        let conn = self.get_conn()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(kind) = filters.kind {
            values.push(kind.to_database_str().to_string().into());
            clauses.push(format!("s.kind = ?{}", values.len()));
        }
        if filters.pinned_only {
            clauses.push("s.pinnedAt IS NOT NULL".to_string());
        }
        if let Some(query) = filters.query.as_deref() {
            if let Some(fts) = fts_query(query) {
                values.push(fts.into());
                let fts_idx = values.len();
                values.push(like_pattern(query.trim()).into());
                let like_idx = values.len();
                clauses.push(format!(
                    "(s.id IN (SELECT selectionId FROM selection_fts WHERE selection_fts MATCH ?{}) OR s.keywords LIKE ?{} ESCAPE '\\')",
                    fts_idx, like_idx
                ));
            }
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM selections s {}", where_clause);
        let total_count: i64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM selections s {} {} LIMIT ?{} OFFSET ?{}",
            ENTRY_COLUMNS,
            where_clause,
            ENTRY_ORDER,
            values.len() + 1,
            values.len() + 2
        );
        values.push(i64::try_from(limit).unwrap_or(i64::MAX).into());
        values.push(i64::try_from(offset).unwrap_or(i64::MAX).into());

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((entries, total_count as u64))
    }

    pub fn find_entry(&self, id: &str) -> DatabaseResult<Option<HistoryEntry>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM selections s WHERE s.id = ?1", ENTRY_COLUMNS);
        Ok(conn.query_row(&sql, [id], Self::row_to_entry).optional()?)
    }

    /// Offers of a selection in insertion order. Corrupt rows are skipped.
    pub fn find_offers(&self, selection_id: &str) -> DatabaseResult<Vec<OfferRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM offers WHERE selectionId = ?1 ORDER BY rowid",
            OFFER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([selection_id], Self::row_to_offer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Ok(offer) => Some(offer),
                Err(e) => {
                    tracing::warn!(selection = %selection_id, error = %e, "Skipping corrupt offer row");
                    None
                }
            })
            .collect())
    }

    /// The offer matching the entry's preferred MIME type, else its first offer
    pub fn find_preferred_offer(&self, selection_id: &str) -> DatabaseResult<Option<OfferRecord>> {
        let conn = self.get_conn()?;
        let sql = format!(
            r#"SELECT {} FROM offers o WHERE o.selectionId = ?1
               ORDER BY (o.mimeType = (SELECT preferredMimeType FROM selections WHERE id = ?1)) DESC, o.rowid
               LIMIT 1"#,
            OFFER_COLUMNS
        );
        conn.query_row(&sql, [selection_id], Self::row_to_offer)
            .optional()?
            .transpose()
    }

    /// Set or clear the pin timestamp. Returns false if the entry does not exist.
    pub fn set_pinned(&self, id: &str, pinned_at: Option<DateTime<Utc>>) -> DatabaseResult<bool> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE selections SET pinnedAt = ?1 WHERE id = ?2",
            params![pinned_at.map(format_db_timestamp), id],
        )?;
        Ok(changed > 0)
    }

    /// Replace the keyword tag; empty text clears it. Returns false if missing.
    pub fn set_keywords(&self, id: &str, keywords: &str) -> DatabaseResult<bool> {
        let conn = self.get_conn()?;
        let trimmed = keywords.trim();
        let value = if trimmed.is_empty() { None } else { Some(trimmed) };
        let changed = conn.execute(
            "UPDATE selections SET keywords = ?1 WHERE id = ?2",
            params![value, id],
        )?;
        Ok(changed > 0)
    }

    pub fn retrieve_keywords(&self, id: &str) -> DatabaseResult<Option<String>> {
        let conn = self.get_conn()?;
        let keywords: Option<Option<String>> = conn
            .query_row("SELECT keywords FROM selections WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(keywords.flatten())
    }

    /// Delete an entry atomically. Returns the blob ids to clean up, or None if missing.
    pub fn remove_entry(&self, id: &str) -> DatabaseResult<Option<Vec<String>>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM selections WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let blob_ids = delete_selection(&tx, id)?;
        tx.commit()?;
        Ok(Some(blob_ids))
    }

    /// Delete every entry. Returns the detached blob ids.
    pub fn remove_all(&self) -> DatabaseResult<Vec<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let blob_ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM offers")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        tx.execute("DELETE FROM selection_fts", [])?;
        tx.execute("DELETE FROM selections", [])?;
        tx.commit()?;
        Ok(blob_ids)
    }

    /// Every offer id currently referenced by metadata
    pub fn offer_ids(&self) -> DatabaseResult<HashSet<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM offers")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
        let kind: String = row.get(3)?;
        let offer_count: i64 = row.get(4)?;
        let pinned_at: Option<String> = row.get(7)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(HistoryEntry {
            id: row.get(0)?,
            dedup_hash: row.get(1)?,
            preferred_mime_type: row.get(2)?,
            kind: Kind::from_database_str(&kind),
            offer_count: offer_count as u32,
            source: row.get(5)?,
            keywords: row.get(6)?,
            pinned_at: pinned_at.as_deref().map(parse_db_timestamp),
            created_at: parse_db_timestamp(&created_at),
            updated_at: parse_db_timestamp(&updated_at),
            text_preview: row.get(10)?,
        })
    }

    /// Unknown encryption modes surface as `Corrupt` rather than being guessed
    fn row_to_offer(row: &rusqlite::Row) -> rusqlite::Result<DatabaseResult<OfferRecord>> {
        let id: String = row.get(0)?;
        let encryption: String = row.get(5)?;
        let byte_size: i64 = row.get(6)?;

        let Some(encryption) = EncryptionMode::from_database_str(&encryption) else {
            return Ok(Err(DatabaseError::Corrupt(format!(
                "offer {} has unknown encryption mode {:?}",
                id, encryption
            ))));
        };

        Ok(Ok(OfferRecord {
            id,
            selection_id: row.get(1)?,
            mime_type: row.get(2)?,
            text_preview: row.get(3)?,
            content_digest: row.get(4)?,
            encryption,
            byte_size: byte_size as u64,
            url_host: row.get(7)?,
        }))
    }
}
