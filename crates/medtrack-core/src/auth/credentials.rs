//! Persistent credential storage.
//!
//! A `CredentialStore` is a dumb string map that survives restarts. The host
//! picks exactly one backend at startup through `open_store`. `Credentials`
//! layers the two keys the session lifecycle cares about on top of it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use keyring::Entry;
use tracing::{debug, warn};

use crate::config::{Config, StorageKind, APP_NAME};

/// Credentials file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Key holding the bearer token
pub const TOKEN_KEY: &str = "auth_token";

/// Key holding the "was logged in" flag
pub const LOGGED_IN_KEY: &str = "was_logged_in";

pub trait CredentialStore: Send + Sync {
    /// Read a value; a key that was never written reads as `None`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Open the backend named in the config.
pub fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match config.storage {
        StorageKind::File => Arc::new(FileStore::new(config.data_dir()?.join(CREDENTIALS_FILE))),
        StorageKind::Keyring => Arc::new(KeyringStore::new(APP_NAME)),
        StorageKind::Memory => Arc::new(MemoryStore::default()),
    };
    debug!(backend = ?config.storage, "Credential store opened");
    Ok(store)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Backends
// ============================================================================

/// In-process map. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// JSON map on disk. The whole file is rewritten on every change.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    guard: Mutex<()>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credentials file")?;
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    /// Like `read_map`, but a file that no longer parses is treated as empty.
    /// The flag is set when the file must be rewritten even if nothing changes.
    fn read_map_for_write(&self) -> Result<(HashMap<String, String>, bool)> {
        match self.read_map() {
            Ok(map) => Ok((map, false)),
            Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                warn!(path = %self.path.display(), error = %e, "Discarding unreadable credentials file");
                Ok((HashMap::new(), true))
            }
            Err(e) => Err(e),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, contents).context("Failed to write credentials file")
    }
}

impl CredentialStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = lock(&self.guard);
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = lock(&self.guard);
        let (mut map, _) = self.read_map_for_write()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = lock(&self.guard);
        let (mut map, discarded) = self.read_map_for_write()?;
        if map.remove(key).is_some() || discarded {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

/// One OS keychain entry per key.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store value in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

// ============================================================================
// Typed view
// ============================================================================

/// Snapshot of what is persisted. Never use it to decide whether the user is
/// logged in; that is what `Session` is for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credential {
    pub token: Option<String>,
    pub present: bool,
}

/// The bearer token and login flag on top of a `CredentialStore`.
/// Clone is cheap and all clones share the same store.
#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn CredentialStore>,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub fn token(&self) -> Result<Option<String>> {
        Ok(self.store.get(TOKEN_KEY)?.filter(|t| !t.is_empty()))
    }

    pub fn was_logged_in(&self) -> Result<bool> {
        Ok(self.store.get(LOGGED_IN_KEY)?.as_deref() == Some("true"))
    }

    pub fn load(&self) -> Result<Credential> {
        let token = self.token()?;
        let present = token.is_some() && self.was_logged_in()?;
        Ok(Credential { token, present })
    }

    /// Write the token and the login flag together.
    pub fn persist(&self, token: &str) -> Result<()> {
        self.store.set(TOKEN_KEY, token)?;
        self.store.set(LOGGED_IN_KEY, "true")
    }

    /// Remove both keys. Both removals are attempted even if the first fails.
    pub fn clear(&self) -> Result<()> {
        let token = self.store.remove(TOKEN_KEY);
        let flag = self.store.remove(LOGGED_IN_KEY);
        if let Err(ref e) = token {
            warn!(error = %e, "Failed to remove stored token");
        }
        token.and(flag)
    }
}
