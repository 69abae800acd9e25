//! Selections captured before the data key resolves are held, then stored in order.

use clipstash::{
    ClipboardEngine, EngineConfig, EngineEvent, IngestOutcome, ListFilters, MemoryKeystore, Readiness,
    SecretStore, Selection, SkipReason,
};
use clipstash::keystore::KeystoreError;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Keystore whose first read blocks until the test releases it
struct GatedKeystore {
    inner: MemoryKeystore,
    release: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedKeystore {
    fn new(inner: MemoryKeystore) -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let store = Arc::new(Self {
            inner,
            release: Mutex::new(Some(rx)),
        });
        (store, tx)
    }
}

impl SecretStore for GatedKeystore {
    fn read(&self, service: &str, key: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        let gate = self.release.lock().unwrap().take();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }
        self.inner.read(service, key)
    }

    fn write(&self, service: &str, key: &str, secret: &[u8]) -> Result<(), KeystoreError> {
        self.inner.write(service, key, secret)
    }
}

fn open(dir: &TempDir, secrets: Arc<dyn SecretStore>, pending_capacity: usize) -> Arc<ClipboardEngine> {
    let mut config = EngineConfig::new(dir.path());
    config.pending_capacity = pending_capacity;
    ClipboardEngine::open(config, secrets).unwrap()
}

#[tokio::test]
async fn selections_queue_until_key_resolves() {
    let dir = TempDir::new().unwrap();
    let (keystore, release) = GatedKeystore::new(MemoryKeystore::new());
    let engine = open(&dir, keystore, 8);
    let mut events = engine.subscribe();

    assert_eq!(engine.readiness(), Readiness::Pending);
    assert_eq!(engine.ingest(Selection::text("early one")).unwrap(), IngestOutcome::Queued);
    assert_eq!(engine.ingest(Selection::text("early two")).unwrap(), IngestOutcome::Queued);

    // Stateless filters still apply while pending
    assert_eq!(
        engine.ingest(Selection::new(vec![])).unwrap(),
        IngestOutcome::Skipped(SkipReason::Empty)
    );

    let page = engine.list_all(10, 0, ListFilters::default()).await.unwrap();
    assert_eq!(page.total_count, 0);

    release.send(()).unwrap();
    assert_eq!(engine.wait_until_ready().await, Readiness::Ready { encrypted: true });

    let page = engine.list_all(10, 0, ListFilters::default()).await.unwrap();
    let previews: Vec<_> = page.items.iter().map(|e| e.text_preview.as_str()).collect();
    assert_eq!(previews, vec!["early two", "early one"]);

    // The resolution event follows the replayed inserts
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        let resolved = matches!(event, EngineEvent::EncryptionResolved { .. });
        seen.push(event);
        if resolved {
            break;
        }
    }
    assert_eq!(seen.last(), Some(&EngineEvent::EncryptionResolved { encrypted: true }));
    let inserts = seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::EntryInserted { .. }))
        .count();
    assert_eq!(inserts, 2);
}

#[tokio::test]
async fn full_queue_drops_oldest() {
    let dir = TempDir::new().unwrap();
    let (keystore, release) = GatedKeystore::new(MemoryKeystore::new());
    let engine = open(&dir, keystore, 2);

    for text in ["a", "b", "c"] {
        assert_eq!(engine.ingest(Selection::text(text)).unwrap(), IngestOutcome::Queued);
    }

    release.send(()).unwrap();
    engine.wait_until_ready().await;

    let page = engine.list_all(10, 0, ListFilters::default()).await.unwrap();
    let previews: Vec<_> = page.items.iter().map(|e| e.text_preview.as_str()).collect();
    assert_eq!(previews, vec!["c", "b"]);
}

#[tokio::test]
async fn queued_selections_use_plaintext_when_keystore_fails() {
    let dir = TempDir::new().unwrap();
    let inner = MemoryKeystore::new();
    inner.fail_reads(true);
    let (keystore, release) = GatedKeystore::new(inner);
    let engine = open(&dir, keystore, 4);

    engine.ingest(Selection::text("queued plaintext")).unwrap();
    release.send(()).unwrap();
    assert_eq!(engine.wait_until_ready().await, Readiness::Ready { encrypted: false });

    let files: Vec<_> = std::fs::read_dir(&engine.config().data_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"queued plaintext");
}

#[tokio::test]
async fn queued_duplicates_bubble_up() {
    let dir = TempDir::new().unwrap();
    let (keystore, release) = GatedKeystore::new(MemoryKeystore::new());
    let engine = open(&dir, keystore, 8);

    engine.ingest(Selection::text("twice")).unwrap();
    engine.ingest(Selection::text("twice")).unwrap();
    release.send(()).unwrap();
    engine.wait_until_ready().await;

    let page = engine.list_all(10, 0, ListFilters::default()).await.unwrap();
    assert_eq!(page.total_count, 1);
}

#[tokio::test]
async fn clearing_history_discards_queued_selections() {
    let dir = TempDir::new().unwrap();
    let (keystore, release) = GatedKeystore::new(MemoryKeystore::new());
    let engine = open(&dir, keystore, 8);

    assert_eq!(engine.ingest(Selection::text("cleared before ready")).unwrap(), IngestOutcome::Queued);
    engine.remove_all().unwrap();

    release.send(()).unwrap();
    engine.wait_until_ready().await;

    let page = engine.list_all(10, 0, ListFilters::default()).await.unwrap();
    assert_eq!(page.total_count, 0);
}

#[tokio::test]
async fn disabling_monitoring_discards_queued_selections() {
    let dir = TempDir::new().unwrap();
    let (keystore, release) = GatedKeystore::new(MemoryKeystore::new());
    let engine = open(&dir, keystore, 8);

    engine.ingest(Selection::text("captured then paused")).unwrap();
    engine.set_monitoring(false);
    engine.set_monitoring(true);
    assert_eq!(engine.ingest(Selection::text("after resume")).unwrap(), IngestOutcome::Queued);

    release.send(()).unwrap();
    engine.wait_until_ready().await;

    let page = engine.list_all(10, 0, ListFilters::default()).await.unwrap();
    let previews: Vec<_> = page.items.iter().map(|e| e.text_preview.as_str()).collect();
    assert_eq!(previews, vec!["after resume"]);
}
