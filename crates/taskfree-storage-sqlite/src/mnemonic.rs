//! Recovery phrase manager

use crate::encryption::DerivedKey;
use crate::key_cache::KeyCache;
use crate::phrase::RecoveryPhrase;
use crate::prefs::Prefs;
use crate::Result;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::sync::Arc;

/// Generates, stores and validates the recovery phrase
pub struct MnemonicManager {
    prefs: Prefs,
    cache: Arc<KeyCache>,
    create_lock: Mutex<()>,
}

impl MnemonicManager {
    /// Create manager over the given gateway and key cache
    pub fn new(prefs: Prefs, cache: Arc<KeyCache>) -> Self {
        Self {
            prefs,
            cache,
            create_lock: Mutex::new(()),
        }
    }

    /// Return the stored phrase, generating and persisting one only if none exists.
    ///
    /// Never replaces an existing phrase: a key may already be derived from it.
    pub fn get_or_create_phrase(&self) -> Result<RecoveryPhrase> {
        let _guard = self.create_lock.lock();

        if let Some(existing) = self.prefs.load_phrase()? {
            return Ok(existing);
        }

        let phrase = RecoveryPhrase::generate(&mut OsRng);
        // Hash goes first so a stored phrase always has a matching hash
        self.prefs.save_phrase_hash(&phrase.hash())?;
        self.prefs.save_phrase(&phrase)?;
        tracing::info!("Generated new recovery phrase");
        Ok(phrase)
    }

    /// Compare a candidate against the stored hash. False when no hash is stored.
    pub fn is_phrase_valid(&self, candidate: &RecoveryPhrase) -> bool {
        let stored = match self.prefs.load_phrase_hash() {
            Ok(Some(hash)) => hash,
            Ok(None) => {
                tracing::warn!("No phrase hash stored; cannot validate recovery phrase");
                return false;
            }
            Err(e) => {
                tracing::warn!("Failed to read phrase hash: {}", e);
                return false;
            }
        };

        let valid = candidate.hash() == stored;
        tracing::info!("Recovery phrase validation {}", if valid { "succeeded" } else { "failed" });
        valid
    }

    /// Re-persist an already validated phrase, then derive, persist and cache its key.
    ///
    /// Does not re-validate; callers check [`MnemonicManager::is_phrase_valid`] first.
    pub fn store_phrase(&self, candidate: &RecoveryPhrase) -> Result<DerivedKey> {
        self.prefs.save_phrase_hash(&candidate.hash())?;
        self.prefs.save_phrase(candidate)?;

        let key = DerivedKey::derive(candidate);
        self.prefs.save_derived_key(&key)?;
        self.cache.cache_key(&key);
        tracing::info!("Recovery phrase restored and key cached");
        Ok(key)
    }

    /// Whether a key is cached or persisted
    pub fn has_key(&self) -> Result<bool> {
        if self.cache.is_cached() {
            return Ok(true);
        }
        Ok(self.prefs.load_derived_key()?.is_some())
    }

    /// Stored phrase for read-only display
    pub fn load_phrase(&self) -> Result<Option<RecoveryPhrase>> {
        self.prefs.load_phrase()
    }
}
