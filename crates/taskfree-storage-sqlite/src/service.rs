//! Encryption service facade
//!
//! Wires the gateway, key cache, database factory, phrase manager, migrator
//! and recovery flow together and exposes the surface a front end drives.

use crate::config::StorageConfig;
use crate::database::Database;
use crate::factory::DatabaseFactory;
use crate::key_cache::KeyCache;
use crate::migrator::{EncryptionMigrator, InterruptedMigration};
use crate::mnemonic::MnemonicManager;
use crate::phrase::RecoveryPhrase;
use crate::prefs::Prefs;
use crate::recovery::{KeyRecoveryFlow, RecoveryState};
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;

/// Entry point for at-rest encryption
pub struct EncryptionService {
    config: StorageConfig,
    prefs: Prefs,
    factory: Arc<DatabaseFactory>,
    mnemonic: Arc<MnemonicManager>,
    migrator: Arc<EncryptionMigrator>,
    recovery: Arc<KeyRecoveryFlow>,
}

impl EncryptionService {
    /// Open the service over the files named in `config`.
    ///
    /// Rolls back or finishes any migration interrupted by process death.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let prefs = Prefs::open(&config)?;
        Self::with_prefs(config, prefs)
    }

    /// Open the service with caller-supplied namespaces
    pub fn with_prefs(config: StorageConfig, prefs: Prefs) -> Result<Self> {
        let cache = Arc::new(KeyCache::new());
        let factory = Arc::new(DatabaseFactory::new(
            config.db_paths(),
            prefs.clone(),
            cache.clone(),
        ));
        let mnemonic = Arc::new(MnemonicManager::new(prefs.clone(), cache.clone()));
        let migrator = Arc::new(EncryptionMigrator::new(
            factory.clone(),
            prefs.clone(),
            cache.clone(),
        ));
        let recovery = Arc::new(KeyRecoveryFlow::new(
            prefs.clone(),
            cache,
            factory.clone(),
            mnemonic.clone(),
        ));

        match migrator.recover_interrupted_migration()? {
            InterruptedMigration::None => {}
            outcome => tracing::info!("Startup migration recovery: {:?}", outcome),
        }

        Ok(Self {
            config,
            prefs,
            factory,
            mnemonic,
            migrator,
            recovery,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Encrypted flag
    pub fn is_encrypted(&self) -> Result<bool> {
        self.prefs.is_encrypted()
    }

    /// Migration progress (0..=100, `None` before the first attempt)
    pub fn progress(&self) -> watch::Receiver<Option<u8>> {
        self.migrator.progress()
    }

    /// Migration error of the last attempt
    pub fn error(&self) -> watch::Receiver<Option<String>> {
        self.migrator.error()
    }

    /// Recovery flow state
    pub fn recovery_state(&self) -> watch::Receiver<RecoveryState> {
        self.recovery.state()
    }

    /// Stored phrase, or a newly generated one on first use
    pub fn get_or_create_phrase(&self) -> Result<RecoveryPhrase> {
        self.mnemonic.get_or_create_phrase()
    }

    /// Whether a key is cached or persisted
    pub fn has_key(&self) -> Result<bool> {
        self.mnemonic.has_key()
    }

    /// Stored phrase for read-only display
    pub fn view_phrase(&self) -> Result<Option<RecoveryPhrase>> {
        self.mnemonic.load_phrase()
    }

    /// Encrypt the store with a key derived from `phrase`
    pub async fn begin_encryption(&self, phrase: RecoveryPhrase) -> Result<()> {
        self.migrator.migrate_to_encrypted(phrase).await
    }

    /// Whether the recovery flow must be shown. Evaluated fresh on every call.
    pub fn needs_key_recovery(&self) -> Result<bool> {
        self.recovery.needs_recovery()
    }

    /// Recovery: go to phrase entry
    pub fn restore(&self) -> Result<()> {
        self.recovery.restore()
    }

    /// Recovery: back to the prompt
    pub fn cancel_entry(&self) -> Result<()> {
        self.recovery.cancel_entry()
    }

    /// Recovery: validate entered words and unlock on a match
    pub async fn submit_recovery_phrase(&self, words: Vec<String>) -> Result<bool> {
        self.recovery.submit_recovery_phrase(words).await
    }

    /// Recovery: discard the store and start fresh
    pub fn skip_recovery(&self) -> Result<()> {
        self.recovery.skip()
    }

    /// Run `f` against the live store
    pub fn with_database<T>(&self, f: impl FnOnce(&mut Database) -> Result<T>) -> Result<T> {
        self.factory.with_database(f)
    }

    /// Close the live store handle
    pub fn close(&self) -> Result<()> {
        self.factory.clear_instance()
    }
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("data_dir", &self.config.data_dir)
            .field("factory", &self.factory)
            .field("migrator", &self.migrator)
            .finish()
    }
}
