//! Key recovery flow
//!
//! Entered when the store is marked encrypted but no key can be resolved from
//! the cache or secret storage. The user either re-enters the phrase or wipes
//! the store and starts over unencrypted.

use crate::database::remove_database_files;
use crate::factory::DatabaseFactory;
use crate::key_cache::KeyCache;
use crate::mnemonic::MnemonicManager;
use crate::phrase::RecoveryPhrase;
use crate::prefs::Prefs;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Recovery flow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Asking whether to restore from the phrase or start fresh
    Prompt,
    /// Phrase entry form
    Entry {
        /// Last submission did not match the stored hash
        rejected: bool,
    },
    /// Key restored; store can be opened
    Unlocked,
    /// Store and encryption state discarded
    Wiped,
}

/// State machine for unlocking a store whose key is gone
pub struct KeyRecoveryFlow {
    prefs: Prefs,
    cache: Arc<KeyCache>,
    factory: Arc<DatabaseFactory>,
    mnemonic: Arc<MnemonicManager>,
    state: watch::Sender<RecoveryState>,
}

impl KeyRecoveryFlow {
    /// Create flow in the `Prompt` state
    pub fn new(
        prefs: Prefs,
        cache: Arc<KeyCache>,
        factory: Arc<DatabaseFactory>,
        mnemonic: Arc<MnemonicManager>,
    ) -> Self {
        let (state, _) = watch::channel(RecoveryState::Prompt);
        Self {
            prefs,
            cache,
            factory,
            mnemonic,
            state,
        }
    }

    /// Encrypted flag set and no key in cache or secret storage.
    ///
    /// Not cached: call it again on every start or return to foreground.
    pub fn needs_recovery(&self) -> Result<bool> {
        if !self.prefs.is_encrypted()? || self.cache.is_cached() {
            return Ok(false);
        }
        Ok(self.prefs.load_derived_key()?.is_none())
    }

    /// Observe the state
    pub fn state(&self) -> watch::Receiver<RecoveryState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn current(&self) -> RecoveryState {
        *self.state.borrow()
    }

    /// `Prompt` -> `Entry`. Only while the store is locked.
    pub fn restore(&self) -> Result<()> {
        self.ensure_locked("restore")?;
        self.transition(
            |s| *s == RecoveryState::Prompt,
            RecoveryState::Entry { rejected: false },
            "restore",
        )
    }

    /// `Entry` -> `Prompt`
    pub fn cancel_entry(&self) -> Result<()> {
        self.transition(
            |s| matches!(s, RecoveryState::Entry { .. }),
            RecoveryState::Prompt,
            "cancel entry",
        )
    }

    /// Validate the entered words on the blocking pool. See [`KeyRecoveryFlow::submit_blocking`].
    pub async fn submit_recovery_phrase(self: &Arc<Self>, words: Vec<String>) -> Result<bool> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.submit_blocking(&words))
            .await
            .map_err(|e| Error::InvalidState(format!("Recovery task failed: {}", e)))?
    }

    /// Check the entered words against the stored hash.
    ///
    /// On a match the phrase and key are restored, the open handle is dropped
    /// so the store is reopened keyed, and the flow moves to `Unlocked`.
    /// Otherwise the flow stays in `Entry` with `rejected` set and this returns
    /// `Ok(false)`; retries are unlimited.
    pub fn submit_blocking(&self, words: &[String]) -> Result<bool> {
        if !matches!(self.current(), RecoveryState::Entry { .. }) {
            return Err(Error::InvalidState(format!(
                "Cannot submit a phrase from {:?}",
                self.current()
            )));
        }

        let candidate = match RecoveryPhrase::from_words(words) {
            Ok(phrase) => phrase,
            Err(e) => {
                tracing::info!("Rejected malformed recovery phrase: {}", e);
                self.state
                    .send_replace(RecoveryState::Entry { rejected: true });
                return Ok(false);
            }
        };

        if !self.mnemonic.is_phrase_valid(&candidate) {
            self.state
                .send_replace(RecoveryState::Entry { rejected: true });
            return Ok(false);
        }

        self.mnemonic.store_phrase(&candidate)?;
        self.factory.clear_instance()?;
        self.state.send_replace(RecoveryState::Unlocked);
        tracing::info!("Store unlocked from recovery phrase");
        Ok(true)
    }

    /// `Prompt` -> `Wiped`: delete the live store and every trace of encryption.
    ///
    /// Irreversible. Callers confirm with the user first. Refused unless the
    /// store is locked.
    pub fn skip(&self) -> Result<()> {
        self.ensure_locked("skip recovery")?;
        if self.current() != RecoveryState::Prompt {
            return Err(Error::InvalidState(format!(
                "Cannot skip recovery from {:?}",
                self.current()
            )));
        }

        self.factory
            .with_exclusive_access(|paths| remove_database_files(&paths.live))?;
        self.prefs.clear_encryption()?;
        self.prefs.clear_encryption_secrets()?;
        self.cache.clear_cached_key();

        self.state.send_replace(RecoveryState::Wiped);
        tracing::warn!("Encrypted store discarded; starting fresh without encryption");
        Ok(())
    }

    fn ensure_locked(&self, action: &str) -> Result<()> {
        if self.needs_recovery()? {
            return Ok(());
        }
        tracing::warn!("Refusing to {}: store is not locked", action);
        Err(Error::InvalidState(format!(
            "Cannot {} while the store is readable",
            action
        )))
    }

    fn transition(
        &self,
        allowed: impl Fn(&RecoveryState) -> bool,
        next: RecoveryState,
        action: &str,
    ) -> Result<()> {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if allowed(state) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                tracing::debug!("Recovery flow {:?} -> {:?}", from, next);
                Ok(())
            }
            None => Err(Error::InvalidState(format!(
                "Cannot {} from {:?}",
                action,
                self.current()
            ))),
        }
    }
}
