//! In-memory cache for the active database key.
//!
//! Held only for the lifetime of the owning [`KeyCache`] and never persisted.
//! One instance is normally created at process start and shared (via `Arc`)
//! between the database factory, the migrator and the recovery flow.

use crate::encryption::DerivedKey;
use parking_lot::RwLock;
use zeroize::Zeroize;

/// Process-wide key slot. Reads and writes are serialized by the lock, so a
/// reader never observes a partially written key.
#[derive(Default)]
pub struct KeyCache {
    slot: RwLock<Option<DerivedKey>>,
}

impl KeyCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a copy of the key, wiping any previous one
    pub fn cache_key(&self, key: &DerivedKey) {
        let mut slot = self.slot.write();
        if let Some(previous) = slot.as_mut() {
            previous.zeroize();
        }
        *slot = Some(key.clone());
    }

    /// Get a copy of the cached key
    pub fn get_cached_key(&self) -> Option<DerivedKey> {
        self.slot.read().clone()
    }

    /// Check whether a key is cached
    pub fn is_cached(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Overwrite the cached key bytes with zeros, then drop it
    pub fn clear_cached_key(&self) {
        let mut slot = self.slot.write();
        if let Some(mut key) = slot.take() {
            key.zeroize();
        }
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("cached", &self.is_cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_cache_roundtrip() {
        let cache = KeyCache::new();
        assert!(cache.get_cached_key().is_none());

        let key = DerivedKey::from_bytes([3u8; 32]);
        cache.cache_key(&key);
        assert!(cache.is_cached());
        assert_eq!(cache.get_cached_key().unwrap(), key);
    }

    #[test]
    fn test_clear_empties_slot() {
        let cache = KeyCache::new();
        cache.cache_key(&DerivedKey::from_bytes([9u8; 32]));
        cache.clear_cached_key();
        assert!(!cache.is_cached());
        // Clearing twice is harmless
        cache.clear_cached_key();
    }

    #[test]
    fn test_returned_copy_is_independent() {
        let cache = KeyCache::new();
        cache.cache_key(&DerivedKey::from_bytes([5u8; 32]));

        let mut copy = cache.get_cached_key().unwrap();
        copy.zeroize();

        assert_eq!(cache.get_cached_key().unwrap().as_bytes(), &[5u8; 32]);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_keys() {
        let cache = Arc::new(KeyCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..500u32 {
                    let byte = (i % 2) as u8 * 0xFF;
                    cache.cache_key(&DerivedKey::from_bytes([byte; 32]));
                    if i % 7 == 0 {
                        cache.clear_cached_key();
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(key) = cache.get_cached_key() {
                            let first = key.as_bytes()[0];
                            assert!(key.as_bytes().iter().all(|&b| b == first));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
