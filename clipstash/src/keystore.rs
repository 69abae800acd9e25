//! Platform keystore access and the one-shot key provider
//!
//! [`SecretStore`] is the boundary to the secure keystore; [`SystemKeyring`]
//! backs it with the OS credential store via `keyring`, [`MemoryKeystore`]
//! keeps secrets in process for headless hosts and tests.

use crate::crypto::{CryptoError, EncryptionKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("keystore read failed: {0}")]
    Read(String),
    #[error("keystore write failed: {0}")]
    Write(String),
    #[error("stored key is invalid: {0}")]
    InvalidKey(#[from] CryptoError),
    #[error("keystore task did not complete")]
    Cancelled,
}

/// Secure secret storage keyed by (service, key name)
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when no secret exists under this name
    fn read(&self, service: &str, key: &str) -> Result<Option<Vec<u8>>, KeystoreError>;
    fn write(&self, service: &str, key: &str, secret: &[u8]) -> Result<(), KeystoreError>;
}

/// OS credential store: Keychain, Credential Manager, or Secret Service on Linux
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKeyring;

impl SecretStore for SystemKeyring {
    fn read(&self, service: &str, key: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        let entry = keyring::Entry::new(service, key).map_err(|e| KeystoreError::Read(e.to_string()))?;
        match entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeystoreError::Read(e.to_string())),
        }
    }

    fn write(&self, service: &str, key: &str, secret: &[u8]) -> Result<(), KeystoreError> {
        let entry = keyring::Entry::new(service, key).map_err(|e| KeystoreError::Write(e.to_string()))?;
        entry
            .set_secret(secret)
            .map_err(|e| KeystoreError::Write(e.to_string()))
    }
}

/// In-process keystore with switchable failures
#[derive(Default)]
pub struct MemoryKeystore {
    secrets: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, service: &str, key: &str, secret: &[u8]) -> Self {
        self.secrets
            .lock()
            .insert((service.to_string(), key.to_string()), secret.to_vec());
        self
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, service: &str, key: &str) -> bool {
        self.secrets
            .lock()
            .contains_key(&(service.to_string(), key.to_string()))
    }
}

impl SecretStore for MemoryKeystore {
    fn read(&self, service: &str, key: &str) -> Result<Option<Vec<u8>>, KeystoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(KeystoreError::Read("keystore unavailable".into()));
        }
        Ok(self
            .secrets
            .lock()
            .get(&(service.to_string(), key.to_string()))
            .cloned())
    }

    fn write(&self, service: &str, key: &str, secret: &[u8]) -> Result<(), KeystoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeystoreError::Write("keystore is read-only".into()));
        }
        self.secrets
            .lock()
            .insert((service.to_string(), key.to_string()), secret.to_vec());
        Ok(())
    }
}

/// Loads the local data key, provisioning it on first run
#[derive(Clone)]
pub struct KeyProvider {
    store: Arc<dyn SecretStore>,
    service: String,
    key_name: String,
}

impl KeyProvider {
    pub fn new(store: Arc<dyn SecretStore>, service: impl Into<String>, key_name: impl Into<String>) -> Self {
        Self {
            store,
            service: service.into(),
            key_name: key_name.into(),
        }
    }

    /// Read the key, or generate and persist one when none exists.
    ///
    /// A stored secret of the wrong size is an error and is left untouched.
    pub fn obtain_key_blocking(&self) -> Result<EncryptionKey, KeystoreError> {
        if let Some(secret) = self.store.read(&self.service, &self.key_name)? {
            let key = EncryptionKey::from_bytes(&secret)?;
            tracing::debug!(service = %self.service, "Loaded existing data key");
            return Ok(key);
        }

        let key = EncryptionKey::generate();
        self.store
            .write(&self.service, &self.key_name, &key.to_secret())?;
        tracing::info!(service = %self.service, "Provisioned new data key");
        Ok(key)
    }

    /// Keystore calls may block on IPC, so they run on the blocking pool
    pub async fn obtain_key(&self) -> Result<EncryptionKey, KeystoreError> {
        let provider = self.clone();
        tokio::task::spawn_blocking(move || provider.obtain_key_blocking())
            .await
            .map_err(|_| KeystoreError::Cancelled)?
    }
}
