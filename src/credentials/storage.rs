//! Encrypted credential storage on the local filesystem.
//!
//! One AES-256-GCM blob per identity, next to the key file that encrypts them.

use super::encryption::{self, EncryptionKey, KeyOrigin, KeyRecovery};
use super::CredentialRecord;
use crate::error::{Result, TallyError};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the key file inside the store directory. Never listed, never deleted by the store.
pub const KEY_FILE_NAME: &str = ".keystore";

/// Encrypted credential storage backed by a directory.
///
/// # Layout
/// ```text
/// <dir>/.keystore     Base64 AES-256 key, mode 0600
/// <dir>/<identity>    nonce || ciphertext || tag of the JSON-serialized record
/// <dir>/.<identity>.<uuid>.tmp   in-flight write, renamed over <identity>
/// ```
///
/// # Thread Safety
/// - Writers (`set`, `delete`, `clear`) are serialized by a store-wide mutex
/// - Readers take no lock; atomic rename means they never observe a partial blob
pub struct EncryptedTokenStore {
    dir: PathBuf,
    key: EncryptionKey,
    write_lock: Mutex<()>,
}

impl EncryptedTokenStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// Loads the key file, or generates it on first use. `recovery` decides whether a
    /// corrupt key file is replaced or reported.
    pub fn open<P: AsRef<Path>>(dir: P, recovery: KeyRecovery) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir)?;

        let (key, origin) = encryption::load_or_create_key(&dir.join(KEY_FILE_NAME), recovery)?;

        let store = Self {
            dir,
            key,
            write_lock: Mutex::new(()),
        };

        if origin != KeyOrigin::Loaded {
            let orphaned = store.keys()?;
            if !orphaned.is_empty() {
                warn!(
                    count = orphaned.len(),
                    "New encryption key generated while records exist; they will be discarded on read"
                );
            }
        }

        info!(dir = %store.dir.display(), "Initialized encrypted token store");
        Ok(store)
    }

    /// Directory the store writes to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Retrieves and decrypts the record stored under `key`.
    ///
    /// # Returns
    /// * `Ok(Some(record))` - found and decrypted
    /// * `Ok(None)` - nothing stored under `key`
    /// * `Err(TallyError::CorruptedRecord)` - blob failed integrity checks or does not deserialize
    pub fn get(&self, key: &str) -> Result<Option<CredentialRecord>> {
        let path = self.record_path(key)?;

        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let plaintext = encryption::decrypt(&blob, &self.key).map_err(|e| {
            if e.is_integrity_failure() {
                TallyError::CorruptedRecord {
                    key: key.to_string(),
                }
            } else {
                e.into()
            }
        })?;

        let record = serde_json::from_slice(&plaintext).map_err(|_| TallyError::CorruptedRecord {
            key: key.to_string(),
        })?;

        debug!(identity = key, "Retrieved and decrypted credential record");
        Ok(Some(record))
    }

    /// Encrypts and stores `record` under `key`, replacing any previous value atomically.
    pub fn set(&self, key: &str, record: &CredentialRecord) -> Result<()> {
        let path = self.record_path(key)?;

        let plaintext = serde_json::to_vec(record)?;
        let blob = encryption::encrypt(&plaintext, &self.key)?;

        let tmp_path = self.dir.join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple()));

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = write_private_file(&tmp_path, &blob).and_then(|_| fs::rename(&tmp_path, &path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(identity = key, "Stored encrypted credential record");
        Ok(())
    }

    /// Deletes the record stored under `key`.
    ///
    /// # Returns
    /// * `Ok(true)` - record deleted
    /// * `Ok(false)` - nothing was stored
    pub fn delete(&self, key: &str) -> Result<bool> {
        let path = self.record_path(key)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(identity = key, "Deleted credential record");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every stored record. The key file is kept.
    ///
    /// Returns the number of records removed.
    pub fn clear(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut removed = 0;
        for key in self.list_keys()? {
            match fs::remove_file(self.dir.join(&key)) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(identity = %key, error = %e, "Failed to delete credential record"),
            }
        }

        info!(removed, "Cleared stored credential records");
        Ok(removed)
    }

    /// Lists stored identities (every regular, non-hidden file except the key file), sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.list_keys()
    }

    fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    fn record_path(&self, key: &str) -> Result<PathBuf> {
        validate_identity(key)?;
        Ok(self.dir.join(key))
    }
}

/// Identity keys become file names: non-empty, no separators, not hidden, bounded length.
fn validate_identity(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));

    if valid {
        Ok(())
    } else {
        Err(TallyError::InvalidIdentity(key.to_string()))
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
