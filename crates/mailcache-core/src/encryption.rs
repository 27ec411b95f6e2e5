//! Encryption keys for account caches.
//!
//! Each account database can be opened with a random per-account key applied
//! through `SQLite`'s `key` pragma (honoured by SQLCipher builds). Keys live
//! in the platform credential store:
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - macOS: Keychain
//! - Windows: Credential Manager

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use keyring::Entry;
use rand::RngCore;
use sqlx::sqlite::SqliteConnectOptions;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::Result;

/// Service name used for keyring entries.
const SERVICE_NAME: &str = "mailcache";

/// Header of an unencrypted `SQLite` file.
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

const KEY_BYTES: usize = 32;

/// Source of per-account database keys.
pub trait KeyStore: Send + Sync + std::fmt::Debug {
    /// Return the account's key, generating and storing one if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be read or stored.
    fn get_or_create(&self, email: &str) -> Result<String>;

    /// Forget the account's key. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the key store cannot be reached.
    fn delete(&self, email: &str) -> Result<()>;
}

/// Generate a new random key, base64 encoded.
#[must_use]
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Add the `key` pragma to connection options.
#[must_use]
pub fn apply_key(options: SqliteConnectOptions, key: &str) -> SqliteConnectOptions {
    options.pragma("key", format!("'{}'", key.replace('\'', "''")))
}

/// Whether a database file is not a plain `SQLite` file.
///
/// Missing and empty files are reported as not encrypted.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub async fn is_encrypted(path: &Path) -> Result<bool> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut header = [0u8; 16];
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(read == header.len() && &header != SQLITE_HEADER)
}

/// Keys stored in the system keyring.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringKeyStore;

impl KeyringKeyStore {
    fn entry(email: &str) -> Result<Entry> {
        Ok(Entry::new(SERVICE_NAME, &format!("{SERVICE_NAME}_cache_key_{email}"))?)
    }
}

impl KeyStore for KeyringKeyStore {
    fn get_or_create(&self, email: &str) -> Result<String> {
        let entry = Self::entry(email)?;
        match entry.get_password() {
            Ok(key) => Ok(key),
            Err(keyring::Error::NoEntry) => {
                let key = generate_key();
                entry.set_password(&key)?;
                debug!("Stored new cache key for {}", email);
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, email: &str) -> Result<()> {
        match Self::entry(email)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys held in process memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryKeyStore {
    /// Creates an empty key store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the key of an account, e.g. to simulate a wrong key.
    pub fn insert(&self, email: &str, key: impl Into<String>) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(email.to_string(), key.into());
    }

    /// Whether a key exists for the account.
    #[must_use]
    pub fn contains(&self, email: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(email)
    }
}

impl KeyStore for MemoryKeyStore {
    fn get_or_create(&self, email: &str) -> Result<String> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(keys
            .entry(email.to_string())
            .or_insert_with(generate_key)
            .clone())
    }

    fn delete(&self, email: &str) -> Result<()> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(email);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_random() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), KEY_BYTES);
    }

    #[test]
    fn test_memory_key_store_is_stable() {
        let store = MemoryKeyStore::new();
        let first = store.get_or_create("a@example.com").unwrap();
        assert_eq!(store.get_or_create("a@example.com").unwrap(), first);
        assert_ne!(store.get_or_create("b@example.com").unwrap(), first);

        store.delete("a@example.com").unwrap();
        assert!(!store.contains("a@example.com"));
        store.delete("a@example.com").unwrap();
    }

    #[tokio::test]
    async fn test_plain_database_is_not_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        assert!(!is_encrypted(&path).await.unwrap());

        let pool = crate::store::open_pool(crate::store::connect_options(&path))
            .await
            .unwrap();
        pool.close().await;
        assert!(!is_encrypted(&path).await.unwrap());

        tokio::fs::write(&path, [7u8; 64]).await.unwrap();
        assert!(is_encrypted(&path).await.unwrap());
    }
}
