//! Offer payload files
//!
//! One file per offer id directly under the data directory, with no extension.
//! Files are written to a temporary name and renamed so a crash never leaves a
//! truncated blob under a live id.

use crate::crypto::{CryptoError, EncryptionKey};
use crate::interface::EncryptionMode;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const TEMP_SUFFIX: &str = ".partial";

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("invalid blob id: {0}")]
    InvalidId(String),
    #[error("blob {0} not found")]
    NotFound(String),
    #[error("blob {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob store directory error: {0}")]
    Directory(#[from] std::io::Error),
    #[error("blob {0} is encrypted but no key is loaded")]
    KeyUnavailable(String),
    #[error("blob crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

fn validate_blob_id(id: &str) -> Result<(), BlobError> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| BlobError::InvalidId(id.to_string()))
}

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create the data directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf, BlobError> {
        validate_blob_id(id)?;
        Ok(self.root.join(id))
    }

    /// Store `bytes` under `id`, sealed with `key` when present. Returns the mode used.
    pub fn write(&self, id: &str, bytes: &[u8], key: Option<&EncryptionKey>) -> Result<EncryptionMode, BlobError> {
        let path = self.path_for(id)?;
        let (payload, mode) = match key {
            Some(key) => (key.encrypt(bytes)?, EncryptionMode::Local),
            None => (bytes.to_vec(), EncryptionMode::None),
        };

        let io_err = |source| BlobError::Io { id: id.to_string(), source };
        let temp = self.root.join(format!("{}{}", id, TEMP_SUFFIX));
        let mut file = std::fs::File::create(&temp).map_err(io_err)?;
        file.write_all(&payload).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        std::fs::rename(&temp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            io_err(e)
        })?;
        Ok(mode)
    }

    pub fn read(&self, id: &str, mode: EncryptionMode, key: Option<&EncryptionKey>) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(id)?;
        let stored = std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound(id.to_string())
            } else {
                BlobError::Io { id: id.to_string(), source }
            }
        })?;

        match mode {
            EncryptionMode::None => Ok(stored),
            EncryptionMode::Local => {
                let key = key.ok_or_else(|| BlobError::KeyUnavailable(id.to_string()))?;
                Ok(key.decrypt(&stored)?)
            }
        }
    }

    /// A missing file counts as deleted
    pub fn delete(&self, id: &str) -> Result<(), BlobError> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobError::Io { id: id.to_string(), source }),
        }
    }

    /// Wipe the whole data directory and recreate it empty
    pub fn delete_all(&self) -> Result<(), BlobError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Remove every entry in the data directory for which `keep` is false.
    /// Leftover temporary files and foreign names are removed too.
    pub fn sweep<F: Fn(&str) -> bool>(&self, keep: F) -> Result<usize, BlobError> {
        let mut removed = 0;
        for dir_entry in std::fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if keep(name.as_ref()) {
                continue;
            }

            let path = dir_entry.path();
            let result = if dir_entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(blob = %name, error = %e, "Failed to sweep orphan blob"),
            }
        }
        Ok(removed)
    }
}
