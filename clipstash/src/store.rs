//! ClipboardEngine - clipboard history orchestration
//!
//! Ingestion: filter → choose representation → dedupe → write blobs and metadata
//! in one transaction → notify. Queries run on blocking worker threads.
//!
//! Readiness:
//! The engine opens in `Readiness::Pending` while the data key is fetched from
//! the keystore. Selections arriving meanwhile are queued (bounded, oldest
//! dropped first) and replayed in order once the key resolves, with or without
//! a key. The ingestion gate serializes every write that touches blobs, so the
//! replay, live ingestion, `remove_all` and the orphan sweep never interleave.

use crate::blob_store::BlobStore;
use crate::config::EngineConfig;
use crate::content_detection;
use crate::crypto::EncryptionKey;
use crate::database::{Database, RemovedEntries};
use crate::interface::{
    EncryptionMode, EngineError, EngineEvent, HistoryEntry, IngestOutcome, ListFilters, Offer, Page,
    Readiness, Selection, SkipReason,
};
use crate::keystore::{KeyProvider, KeystoreError, SecretStore};
use crate::models::{dedup_hash, NewEntry, NewOffer};
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};

/// Global fallback Tokio runtime for callers outside any runtime context.
/// Shared across all engines and never dropped.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create fallback tokio runtime")
});

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A selection that passed the stateless filters
#[derive(Debug)]
struct PreparedSelection {
    chosen: Offer,
    extras: Vec<Offer>,
    source: Option<String>,
}

struct IngestGate {
    ready: bool,
    pending: VecDeque<PreparedSelection>,
}

enum Persisted {
    Inserted {
        entry: HistoryEntry,
        pruned: RemovedEntries,
    },
    BubbledUp(String),
}

/// Thread-safe clipboard history engine
///
/// Concurrency Model:
/// - Database uses an r2d2 pool in WAL mode (reads never wait on the writer)
/// - Ingestion and blob-directory wide writes hold the ingestion gate
/// - Blocking reads run on tokio::spawn_blocking threads
pub struct ClipboardEngine {
    db: Arc<Database>,
    blobs: Arc<BlobStore>,
    config: EngineConfig,
    key: RwLock<Option<Arc<EncryptionKey>>>,
    monitoring: AtomicBool,
    gate: Mutex<IngestGate>,
    readiness: watch::Sender<Readiness>,
    events: broadcast::Sender<EngineEvent>,
}

impl ClipboardEngine {
    /// Open the store and start resolving the data key in the background.
    pub fn open(config: EngineConfig, secrets: Arc<dyn SecretStore>) -> Result<Arc<Self>, EngineError> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        let blobs = BlobStore::open(&config.data_dir)?;
        tracing::info!(
            database = %config.database_path.display(),
            data_dir = %config.data_dir.display(),
            "Clipboard engine opened"
        );
        Ok(Self::start(db, blobs, config, secrets))
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory(
        config: EngineConfig,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Arc<Self>, EngineError> {
        let db = Database::open_in_memory()?;
        let blobs = BlobStore::open(&config.data_dir)?;
        Ok(Self::start(db, blobs, config, secrets))
    }

    fn start(db: Database, blobs: BlobStore, config: EngineConfig, secrets: Arc<dyn SecretStore>) -> Arc<Self> {
        let provider = KeyProvider::new(secrets, config.keystore_service.clone(), config.key_name.clone());
        let (readiness, _) = watch::channel(Readiness::Pending);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Arc::new(Self {
            db: Arc::new(db),
            blobs: Arc::new(blobs),
            monitoring: AtomicBool::new(config.monitoring),
            config,
            key: RwLock::new(None),
            gate: Mutex::new(IngestGate {
                ready: false,
                pending: VecDeque::new(),
            }),
            readiness,
            events,
        });

        let weak = Arc::downgrade(&engine);
        engine.runtime_handle().spawn(async move {
            let result = provider.obtain_key().await;
            let resolved = tokio::task::spawn_blocking(move || Self::resolve_encryption(weak, result)).await;
            if resolved.is_err() {
                tracing::error!("Encryption resolution task panicked");
            }
        });

        engine
    }

    /// Get a tokio runtime handle - uses current runtime if available, otherwise global fallback
    fn runtime_handle(&self) -> tokio::runtime::Handle {
        tokio::runtime::Handle::try_current()
            .unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // READINESS
    // ═══════════════════════════════════════════════════════════════════════════════

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Resolves once the key provider has finished, successfully or not
    pub async fn wait_until_ready(&self) -> Readiness {
        let mut rx = self.readiness.subscribe();
        let result = rx.wait_for(Readiness::is_ready).await.map(|r| *r);
        result.unwrap_or_else(|_| self.readiness())
    }

    fn resolve_encryption(engine: Weak<Self>, result: Result<EncryptionKey, KeystoreError>) {
        let Some(engine) = engine.upgrade() else {
            return;
        };

        let key = match result {
            Ok(key) => Some(Arc::new(key)),
            Err(e) => {
                tracing::error!(error = %e, "Data key unavailable, storing clipboard history unencrypted");
                None
            }
        };
        let encrypted = key.is_some();

        let mut gate = engine.gate.lock();
        *engine.key.write() = key;

        let queued = std::mem::take(&mut gate.pending);
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Replaying selections received before key resolution");
        }
        for prepared in queued {
            if let Err(e) = engine.persist(prepared) {
                tracing::error!(error = %e, "Failed to store queued selection");
            }
        }

        gate.ready = true;
        engine.readiness.send_replace(Readiness::Ready { encrypted });
        drop(gate);

        tracing::info!(encrypted, "Clipboard encryption resolved");
        engine.emit(EngineEvent::EncryptionResolved { encrypted });
    }

    fn current_key(&self) -> Option<Arc<EncryptionKey>> {
        self.key.read().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // MONITORING
    // ═══════════════════════════════════════════════════════════════════════════════

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Disabling also discards selections still waiting for the data key
    pub fn set_monitoring(&self, enabled: bool) {
        let previous = {
            let mut gate = self.gate.lock();
            if !enabled {
                let dropped = gate.pending.len();
                gate.pending.clear();
                if dropped > 0 {
                    tracing::info!(dropped, "Discarded queued selections");
                }
            }
            self.monitoring.swap(enabled, Ordering::SeqCst)
        };
        if previous != enabled {
            tracing::info!(enabled, "Clipboard monitoring toggled");
            self.emit(EngineEvent::MonitoringChanged { enabled });
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // INGESTION
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Stateless filtering: strip empties, collapse MIME duplicates, pick the stored offer
    fn prepare(&self, selection: Selection) -> Result<PreparedSelection, SkipReason> {
        if selection.offers.iter().any(Offer::is_concealed_marker) {
            return Err(SkipReason::Concealed);
        }

        let mut seen = HashSet::new();
        let offers: Vec<Offer> = selection
            .offers
            .into_iter()
            .filter(|offer| !offer.data.is_empty())
            .filter(|offer| seen.insert(offer.mime_type.clone()))
            .collect();

        if offers.is_empty() {
            return Err(SkipReason::Empty);
        }

        let chosen = content_detection::select_preferred_offer(&offers).ok_or(SkipReason::Unsupported)?;
        if chosen.data.is_empty() {
            return Err(SkipReason::Empty);
        }

        let extras = if self.config.record_all_offers {
            let chosen_essence = content_detection::essence(&chosen.mime_type);
            offers
                .into_iter()
                .filter(|offer| content_detection::essence(&offer.mime_type) != chosen_essence)
                .collect()
        } else {
            Vec::new()
        };

        Ok(PreparedSelection {
            chosen,
            extras,
            source: selection.source_app,
        })
    }

    /// Capture one selection.
    ///
    /// Blocking: performs file and database I/O on the calling thread.
    pub fn ingest(&self, selection: Selection) -> Result<IngestOutcome, EngineError> {
        if !self.is_monitoring() {
            return Ok(IngestOutcome::Skipped(SkipReason::MonitoringDisabled));
        }

        let prepared = match self.prepare(selection) {
            Ok(prepared) => prepared,
            Err(SkipReason::Concealed) => {
                tracing::debug!("Ignoring concealed selection");
                return Ok(IngestOutcome::Skipped(SkipReason::Concealed));
            }
            Err(reason) => {
                tracing::debug!(?reason, "Skipping selection");
                return Ok(IngestOutcome::Skipped(reason));
            }
        };

        let mut gate = self.gate.lock();
        if !gate.ready {
            if gate.pending.len() >= self.config.pending_capacity {
                gate.pending.pop_front();
                tracing::warn!(
                    capacity = self.config.pending_capacity,
                    "Pending selection queue full, dropping oldest"
                );
            }
            gate.pending.push_back(prepared);
            return Ok(IngestOutcome::Queued);
        }

        let outcome = self.persist(prepared);
        drop(gate);

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Failed to store selection");
        }
        outcome
    }

    /// Write one prepared selection. Caller holds the ingestion gate.
    fn persist(&self, prepared: PreparedSelection) -> Result<IngestOutcome, EngineError> {
        let PreparedSelection { chosen, extras, source } = prepared;
        let hash = dedup_hash(&chosen.data);
        let key = self.current_key();
        let now = Utc::now();
        let mut written_blobs: Vec<String> = Vec::new();

        let result = self.db.write_transaction(|uow| -> Result<Persisted, EngineError> {
            if let Some(id) = uow.try_bubble_up(&hash, now)? {
                return Ok(Persisted::BubbledUp(id));
            }

            let kind = content_detection::classify_kind(&chosen.mime_type, &chosen.data);
            let entry = NewEntry {
                id: uuid::Uuid::new_v4().to_string(),
                dedup_hash: hash.clone(),
                preferred_mime_type: chosen.mime_type.clone(),
                kind,
                offer_count: 1 + extras.len() as u32,
                source: source.clone(),
                timestamp: now,
            };
            uow.insert_entry(&entry)?;

            if kind.is_indexable() {
                uow.index_content(&entry.id, &chosen.data)?;
            }

            let mut text_preview = String::new();
            for (position, offer) in std::iter::once(chosen.clone()).chain(extras.iter().cloned()).enumerate() {
                let mut new_offer = NewOffer::new(&entry.id, offer, EncryptionMode::None);
                // Blob lands before metadata commits
                let mode = self.blobs.write(&new_offer.record.id, &new_offer.data, key.as_deref())?;
                written_blobs.push(new_offer.record.id.clone());
                new_offer.record.encryption = mode;
                uow.insert_offer(&new_offer)?;
                if position == 0 {
                    text_preview = new_offer.record.text_preview.clone();
                }
            }

            let pruned = match self.config.max_entries {
                Some(max_entries) => uow.prune_unpinned_beyond(max_entries, &entry.id)?,
                None => RemovedEntries::default(),
            };

            Ok(Persisted::Inserted {
                entry: entry.to_history_entry(text_preview),
                pruned,
            })
        });

        match result {
            Ok(Persisted::BubbledUp(id)) => {
                tracing::debug!(%id, "Selection already stored, bubbled up");
                Ok(IngestOutcome::BubbledUp { id })
            }
            Ok(Persisted::Inserted { entry, pruned }) => {
                tracing::debug!(id = %entry.id, kind = ?entry.kind, "Stored selection");
                self.emit(EngineEvent::EntryInserted { entry: entry.clone() });
                self.discard_removed(pruned);
                Ok(IngestOutcome::Inserted(entry))
            }
            Err(e) => {
                for id in &written_blobs {
                    self.delete_blob_best_effort(id);
                }
                Err(e)
            }
        }
    }

    /// Ingest every selection from `rx` in arrival order until the channel closes
    pub fn spawn_listener(self: &Arc<Self>, mut rx: mpsc::Receiver<Selection>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        self.runtime_handle().spawn(async move {
            while let Some(selection) = rx.recv().await {
                let engine = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || engine.ingest(selection)).await {
                    Ok(Ok(outcome)) => tracing::trace!(?outcome, "Selection processed"),
                    // Already logged by ingest
                    Ok(Err(_)) => {}
                    Err(e) => tracing::error!(error = %e, "Ingestion task failed"),
                }
            }
            tracing::debug!("Selection source closed, listener stopped");
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════════

    /// Paginated history, pinned entries first then most recent
    pub async fn list_all(&self, limit: usize, offset: usize, filters: ListFilters) -> Result<Page<HistoryEntry>, EngineError> {
        let db = Arc::clone(&self.db);
        let handle = self
            .runtime_handle()
            .spawn_blocking(move || db.list_entries(limit, offset, &filters));

        match handle.await {
            Ok(Ok((items, total_count))) => Ok(Page::new(items, total_count, offset)),
            Ok(Err(e)) => Err(e.into()),
            Err(_join_error) => Err(EngineError::Cancelled),
        }
    }

    pub fn find_entry(&self, id: &str) -> Result<Option<HistoryEntry>, EngineError> {
        Ok(self.db.find_entry(id)?)
    }

    /// Load every readable offer of an entry.
    ///
    /// Offers whose blob is missing or undecryptable are skipped. `None` when
    /// the entry does not exist.
    pub async fn retrieve(&self, id: &str) -> Result<Option<Selection>, EngineError> {
        let db = Arc::clone(&self.db);
        let blobs = Arc::clone(&self.blobs);
        let key = self.current_key();
        let id = id.to_string();

        let handle = self.runtime_handle().spawn_blocking(move || -> Result<Option<Selection>, EngineError> {
            let Some(entry) = db.find_entry(&id)? else {
                return Ok(None);
            };

            let mut offers = Vec::new();
            for record in db.find_offers(&id)? {
                match blobs.read(&record.id, record.encryption, key.as_deref()) {
                    Ok(data) => offers.push(Offer::new(record.mime_type, data)),
                    Err(e) => {
                        tracing::warn!(selection = %id, offer = %record.id, error = %e, "Skipping unreadable offer");
                    }
                }
            }

            Ok(Some(Selection {
                offers,
                source_app: entry.source,
            }))
        });

        match handle.await {
            Ok(result) => result,
            Err(_join_error) => Err(EngineError::Cancelled),
        }
    }

    /// Decrypt only the entry's preferred offer
    pub fn preferred_content(&self, id: &str) -> Result<Option<Offer>, EngineError> {
        let Some(record) = self.db.find_preferred_offer(id)? else {
            return Ok(None);
        };
        let key = self.current_key();
        let data = self.blobs.read(&record.id, record.encryption, key.as_deref())?;
        Ok(Some(Offer::new(record.mime_type, data)))
    }

    pub fn keywords(&self, id: &str) -> Result<Option<String>, EngineError> {
        Ok(self.db.retrieve_keywords(id)?)
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // MUTATIONS
    // ═══════════════════════════════════════════════════════════════════════════════

    pub fn set_pinned(&self, id: &str, pinned: bool) -> Result<(), EngineError> {
        let pinned_at = pinned.then(Utc::now);
        if !self.db.set_pinned(id, pinned_at)? {
            return Err(EngineError::NotFound(id.to_string()));
        }
        self.emit(EngineEvent::PinChanged {
            id: id.to_string(),
            pinned,
        });
        Ok(())
    }

    /// Replace the keyword tag; blank text clears it
    pub fn set_keywords(&self, id: &str, keywords: &str) -> Result<(), EngineError> {
        if !self.db.set_keywords(id, keywords)? {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete an entry, then its blob files best-effort
    pub fn remove(&self, id: &str) -> Result<(), EngineError> {
        let Some(blob_ids) = self.db.remove_entry(id)? else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        for blob_id in &blob_ids {
            self.delete_blob_best_effort(blob_id);
        }
        self.emit(EngineEvent::EntryRemoved { id: id.to_string() });
        Ok(())
    }

    /// Clear the whole history, including selections still queued, and wipe the data directory
    pub fn remove_all(&self) -> Result<(), EngineError> {
        let mut gate = self.gate.lock();
        gate.pending.clear();
        let blob_ids = self.db.remove_all()?;
        if let Err(e) = self.blobs.delete_all() {
            tracing::warn!(error = %e, "Failed to wipe clipboard data directory");
        }
        tracing::info!(blobs = blob_ids.len(), "Clipboard history cleared");
        self.emit(EngineEvent::AllEntriesRemoved);
        Ok(())
    }

    /// Delete blob files that no offer references. Returns how many were removed.
    pub fn sweep_orphan_blobs(&self) -> Result<usize, EngineError> {
        // Blobs of an in-flight ingestion are not referenced until it commits
        let _gate = self.gate.lock();
        let known = self.db.offer_ids()?;
        let removed = self.blobs.sweep(|name| known.contains(name))?;
        if removed > 0 {
            tracing::info!(removed, "Swept orphan clipboard blobs");
        }
        Ok(removed)
    }

    fn discard_removed(&self, removed: RemovedEntries) {
        for blob_id in &removed.blob_ids {
            self.delete_blob_best_effort(blob_id);
        }
        for id in removed.selection_ids {
            self.emit(EngineEvent::EntryRemoved { id });
        }
    }

    fn delete_blob_best_effort(&self, blob_id: &str) {
        if let Err(e) = self.blobs.delete(blob_id) {
            tracing::warn!(blob = %blob_id, error = %e, "Failed to delete clipboard blob");
        }
    }
}
