//! Single-handle database factory
//!
//! Keeps at most one open handle to the live store per process. The handle is
//! opened lazily and keyed whenever the encryption flag is set; it is never
//! opened unkeyed over an encrypted store.

use crate::config::DbPaths;
use crate::database::Database;
use crate::encryption::DerivedKey;
use crate::key_cache::KeyCache;
use crate::prefs::Prefs;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Owner of the live store handle
pub struct DatabaseFactory {
    paths: DbPaths,
    prefs: Prefs,
    cache: Arc<KeyCache>,
    slot: Mutex<Option<Database>>,
}

impl DatabaseFactory {
    /// Create factory; nothing is opened yet
    pub fn new(paths: DbPaths, prefs: Prefs, cache: Arc<KeyCache>) -> Self {
        Self {
            paths,
            prefs,
            cache,
            slot: Mutex::new(None),
        }
    }

    /// Well-known store paths
    pub fn paths(&self) -> &DbPaths {
        &self.paths
    }

    /// Whether a handle is currently open
    pub fn is_open(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Key for opening the live store.
    ///
    /// `None` when the store is not encrypted. Otherwise the cached key, or the
    /// persisted key (which is then cached). [`Error::Locked`] when neither exists.
    pub fn resolve_key(&self) -> Result<Option<DerivedKey>> {
        if !self.prefs.is_encrypted()? {
            return Ok(None);
        }

        if let Some(key) = self.cache.get_cached_key() {
            return Ok(Some(key));
        }

        match self.prefs.load_derived_key()? {
            Some(key) => {
                tracing::debug!("Loaded database key from secret storage");
                self.cache.cache_key(&key);
                Ok(Some(key))
            }
            None => Err(Error::Locked),
        }
    }

    /// Run `f` against the live store, opening it first if needed.
    ///
    /// The handle lock is held for the duration of `f`; `f` must not call back
    /// into the factory.
    pub fn with_database<T>(&self, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            let key = self.resolve_key()?;
            let db = Database::open(&self.paths.live, key.as_ref())?;
            *slot = Some(db);
        }

        match slot.as_mut() {
            Some(db) => f(db),
            None => Err(Error::InvalidState("Database handle unavailable".to_string())),
        }
    }

    /// Close and drop the current handle, if any
    pub fn clear_instance(&self) -> Result<()> {
        let handle = self.slot.lock().take();
        match handle {
            Some(db) => {
                tracing::debug!("Closing database handle");
                db.close()
            }
            None => Ok(()),
        }
    }

    /// Close the handle and keep it closed while `f` manipulates the store files
    pub fn with_exclusive_access<T>(&self, f: impl FnOnce(&DbPaths) -> T) -> T {
        let mut slot = self.slot.lock();
        if let Some(db) = slot.take() {
            if let Err(e) = db.close() {
                tracing::warn!("Database close before exclusive access failed: {}", e);
            }
        }
        f(&self.paths)
    }

    /// Build a brand-new keyed store at `path`
    pub fn create_keyed_store(&self, path: &Path, key: &DerivedKey) -> Result<Database> {
        Database::create_keyed(path, key)
    }
}

impl std::fmt::Debug for DatabaseFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseFactory")
            .field("paths", &self.paths)
            .field("open", &self.is_open())
            .finish()
    }
}
