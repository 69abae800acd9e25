//! Local data key and AES-256-GCM blob encryption
//!
//! Sealed layout: 12-byte random nonce followed by ciphertext and the 16-byte tag.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed: wrong key or tampered data")]
    DecryptFailed,
}

/// 256-bit symmetric key, wiped from memory on drop
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKeyLength(self.0.len()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Key material for handing to the keystore; wiped when the copy drops
    pub fn to_secret(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.to_vec())
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_empty_and_large() {
        let key = EncryptionKey::generate();

        let empty = key.encrypt(b"").unwrap();
        assert_eq!(empty.len(), NONCE_LEN + 16);
        assert_eq!(key.decrypt(&empty).unwrap(), Vec::<u8>::new());

        let large: Vec<u8> = (0..(1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
        let sealed = key.encrypt(&large).unwrap();
        assert_ne!(&sealed[NONCE_LEN..NONCE_LEN + 64], &large[..64]);
        assert_eq!(key.decrypt(&sealed).unwrap(), large);
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = EncryptionKey::generate();
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_and_tamper_rejected() {
        let key = EncryptionKey::generate();
        let other = EncryptionKey::generate();
        let mut sealed = key.encrypt(b"secret").unwrap();

        assert_eq!(other.decrypt(&sealed), Err(CryptoError::DecryptFailed));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(key.decrypt(&sealed), Err(CryptoError::DecryptFailed));

        assert_eq!(key.decrypt(&[0u8; 5]), Err(CryptoError::Truncated(5)));
    }

    #[test]
    fn test_from_bytes_validates_length() {
        assert_eq!(
            EncryptionKey::from_bytes(&[0u8; 16]).unwrap_err(),
            CryptoError::InvalidKeyLength(16)
        );
        let key = EncryptionKey::from_bytes(&[7u8; KEY_LEN]).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "EncryptionKey([REDACTED])");
    }
}
