//! AES-256-GCM encryption for stored credential records.
//!
//! Blob layout: `IV (12 bytes) || ciphertext || tag (16 bytes)`. A fresh random IV is
//! drawn for every call to [`encrypt`]. The 256-bit key lives Base64-encoded in a
//! key file with owner-only permissions and is loaded on store initialization.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Secret Cipher failures.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Authentication tag did not verify (tampering or wrong key).
    #[error("ciphertext failed integrity verification")]
    Integrity,
    /// Blob too short to contain IV and tag.
    #[error("ciphertext blob is malformed ({0} bytes)")]
    Malformed(usize),
    /// Key material is not a valid 256-bit key.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("key file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CipherError {
    /// True when the blob could not be authenticated or parsed.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, CipherError::Integrity | CipherError::Malformed(_))
    }
}

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generates a key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CipherError::InvalidKey(format!(
                "must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Validates that a Base64 string decodes to exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<EncryptionKey, CipherError> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .map_err(|e| CipherError::InvalidKey(format!("not valid base64: {}", e)))?;
    EncryptionKey::from_bytes(&key_bytes)
}

/// Encrypts plaintext with AES-256-GCM under a fresh random nonce.
///
/// Returns `nonce || ciphertext || tag`.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CipherError::Integrity)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypts a blob produced by [`encrypt`].
///
/// Fails with [`CipherError::Integrity`] when the tag does not verify and with
/// [`CipherError::Malformed`] when the blob is truncated.
pub fn decrypt(blob: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CipherError> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CipherError::Malformed(blob.len()));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::Integrity)
}

/// What to do when an existing key file cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRecovery {
    /// Surface [`CipherError::InvalidKey`].
    Fail,
    /// Replace it with a newly generated key. Records encrypted under the old key become unreadable.
    Regenerate,
}

/// How the key returned by [`load_or_create_key`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Loaded,
    Generated,
    Regenerated,
}

/// Loads the key at `path`, creating it on first use.
///
/// An existing, valid key is always reused. A corrupt key file is only replaced when
/// `recovery` is [`KeyRecovery::Regenerate`].
pub fn load_or_create_key(
    path: &Path,
    recovery: KeyRecovery,
) -> Result<(EncryptionKey, KeyOrigin), CipherError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        match validate_key(&contents) {
            Ok(key) => {
                debug!(path = %path.display(), "Loaded existing encryption key");
                return Ok((key, KeyOrigin::Loaded));
            }
            Err(e) if recovery == KeyRecovery::Regenerate => {
                warn!(path = %path.display(), error = %e, "Key file is corrupt, generating a new key");
                let key = EncryptionKey::generate();
                write_key_file(path, &key)?;
                return Ok((key, KeyOrigin::Regenerated));
            }
            Err(e) => return Err(e),
        }
    }

    let key = EncryptionKey::generate();
    write_key_file(path, &key)?;
    info!(path = %path.display(), "Generated new encryption key");
    Ok((key, KeyOrigin::Generated))
}

/// Writes the Base64 key with owner-only permissions, replacing any previous file atomically.
fn write_key_file(path: &Path, key: &EncryptionKey) -> Result<(), CipherError> {
    let tmp_path = path.with_extension("tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path)?;
    file.write_all(key.to_base64().as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}
