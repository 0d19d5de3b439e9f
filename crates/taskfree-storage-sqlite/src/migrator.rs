//! Plaintext to encrypted store migration
//!
//! The migration is a linear sequence of [`MigrationStep`]s. The last
//! completed step is persisted in the non-secret namespace so that an attempt
//! cut short by process death can be rolled back on the next start
//! ([`EncryptionMigrator::recover_interrupted_migration`]).
//!
//! File layout during an attempt:
//! - the encrypted copy is built at the temp path;
//! - at the swap the plaintext original moves to the backup path and the
//!   encrypted copy takes the live path;
//! - the backup is deleted only once the encrypted flag is committed.

use crate::config::DbPaths;
use crate::database::{remove_database_files, rename_database, Database};
use crate::encryption::DerivedKey;
use crate::factory::DatabaseFactory;
use crate::key_cache::KeyCache;
use crate::migrations::DATA_TABLES;
use crate::phrase::RecoveryPhrase;
use crate::prefs::Prefs;
use crate::repository::Repository;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Progress published while rows are being copied
const COPY_PROGRESS_START: u8 = 30;
const COPY_PROGRESS_END: u8 = 70;

/// Migration steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MigrationStep {
    /// Nothing done yet
    Idle,
    /// Key derived from the phrase
    KeyDerived,
    /// Live store handle closed
    ConnectionsClosed,
    /// Rows copied into the temp store (or nothing to copy)
    Copied,
    /// Temp store reopened with the key and row counts matched
    Verified,
    /// Encrypted store sits at the live path
    Swapped,
    /// Key persisted and cached, encrypted flag set
    Committed,
}

impl MigrationStep {
    /// Persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::KeyDerived => "key_derived",
            Self::ConnectionsClosed => "connections_closed",
            Self::Copied => "copied",
            Self::Verified => "verified",
            Self::Swapped => "swapped",
            Self::Committed => "committed",
        }
    }

    /// Parse persisted name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "idle" => Some(Self::Idle),
            "key_derived" => Some(Self::KeyDerived),
            "connections_closed" => Some(Self::ConnectionsClosed),
            "copied" => Some(Self::Copied),
            "verified" => Some(Self::Verified),
            "swapped" => Some(Self::Swapped),
            "committed" => Some(Self::Committed),
            _ => None,
        }
    }

    /// Progress value once this step has completed
    pub fn progress(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::KeyDerived => 10,
            Self::ConnectionsClosed => 20,
            Self::Copied => COPY_PROGRESS_END,
            Self::Verified => 80,
            Self::Swapped => 90,
            Self::Committed => 100,
        }
    }
}

/// What startup recovery found and did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptedMigration {
    /// No interrupted attempt
    None,
    /// An attempt died before commit; the plaintext store was put back
    RolledBack {
        /// Last step the attempt completed
        step: MigrationStep,
    },
    /// An attempt died after commit; leftovers were removed
    Completed,
}

/// Drives the one-time plaintext to encrypted migration
pub struct EncryptionMigrator {
    factory: Arc<DatabaseFactory>,
    prefs: Prefs,
    cache: Arc<KeyCache>,
    progress: watch::Sender<Option<u8>>,
    error: watch::Sender<Option<String>>,
    running: Arc<Mutex<()>>,
}

impl EncryptionMigrator {
    /// Create migrator
    pub fn new(factory: Arc<DatabaseFactory>, prefs: Prefs, cache: Arc<KeyCache>) -> Self {
        let (progress, _) = watch::channel(None);
        let (error, _) = watch::channel(None);
        Self {
            factory,
            prefs,
            cache,
            progress,
            error,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Progress 0..=100; `None` before the first attempt
    pub fn progress(&self) -> watch::Receiver<Option<u8>> {
        self.progress.subscribe()
    }

    /// Human-readable error of the last attempt
    pub fn error(&self) -> watch::Receiver<Option<String>> {
        self.error.subscribe()
    }

    /// Whether an attempt is running
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Migrate the live store to an encrypted one keyed from `phrase`.
    ///
    /// Runs on the blocking pool. A second call while one is running fails with
    /// [`Error::MigrationInProgress`]. Once started, the attempt runs to
    /// completion even if the returned future is dropped.
    pub async fn migrate_to_encrypted(self: &Arc<Self>, phrase: RecoveryPhrase) -> Result<()> {
        let guard = Arc::clone(&self.running)
            .try_lock_owned()
            .map_err(|_| Error::MigrationInProgress)?;

        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            this.run_attempt(&phrase)
        })
        .await
        .map_err(|e| Error::Migration(format!("Migration task failed: {}", e)))?
    }

    /// Blocking variant of [`EncryptionMigrator::migrate_to_encrypted`].
    ///
    /// Shares the same single-flight guard.
    pub fn migrate_blocking(&self, phrase: &RecoveryPhrase) -> Result<()> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| Error::MigrationInProgress)?;
        self.run_attempt(phrase)
    }

    /// Caller holds `running`
    fn run_attempt(&self, phrase: &RecoveryPhrase) -> Result<()> {
        // Rejected before touching the observable state of the last attempt
        if self.prefs.is_encrypted()? {
            tracing::info!("Database is already encrypted, nothing to migrate");
            return Err(already_encrypted());
        }

        self.error.send_replace(None);
        self.progress.send_replace(Some(0));
        tracing::info!("Starting database encryption migration");

        let result = self.run_migration(phrase);
        match &result {
            Ok(()) => tracing::info!("Database encryption migration completed successfully"),
            Err(e) => {
                tracing::error!("Migration failed: {}", e);
                self.error
                    .send_replace(Some(format!("Migration failed: {}", e.user_message())));
            }
        }
        result
    }

    fn run_migration(&self, phrase: &RecoveryPhrase) -> Result<()> {
        self.recover_interrupted_migration()?;
        let was_encrypted = self.prefs.is_encrypted()?;

        let key = match self.derive_key(phrase) {
            Ok(key) => key,
            Err(e) => {
                self.factory.with_exclusive_access(|paths| {
                    self.cleanup_failed_migration(paths, was_encrypted)
                });
                return Err(e);
            }
        };

        self.factory.with_exclusive_access(|paths| -> Result<()> {
            // Flag may have been committed by another writer since the first check
            if self.prefs.is_encrypted()? {
                self.prefs.flags().clear_migration_marker()?;
                return Err(already_encrypted());
            }

            let outcome = self.swap_in_encrypted(paths, &key);
            if outcome.is_err() {
                self.cleanup_failed_migration(paths, was_encrypted);
            }
            outcome
        })
    }

    fn derive_key(&self, phrase: &RecoveryPhrase) -> Result<DerivedKey> {
        self.prefs
            .flags()
            .begin_migration_marker(Utc::now().timestamp_millis())?;
        let key = DerivedKey::derive(phrase);
        self.advance(MigrationStep::KeyDerived)?;
        Ok(key)
    }

    /// Runs with the live handle closed and held closed
    fn swap_in_encrypted(&self, paths: &DbPaths, key: &DerivedKey) -> Result<()> {
        self.advance(MigrationStep::ConnectionsClosed)?;

        if paths.live.exists() {
            tracing::debug!("Existing database found, encrypting by copy");
            let expected = self.copy_into_temp(paths, key)?;
            self.advance(MigrationStep::Copied)?;

            verify_temp_store(paths, key, &expected)?;
            self.advance(MigrationStep::Verified)?;

            swap_files(paths)?;
        } else {
            tracing::debug!("No existing database, encrypted store will be created on first open");
            self.advance(MigrationStep::Copied)?;
            self.advance(MigrationStep::Verified)?;
        }
        self.advance(MigrationStep::Swapped)?;

        self.commit(paths, key)
    }

    fn copy_into_temp(&self, paths: &DbPaths, key: &DerivedKey) -> Result<Vec<(&'static str, i64)>> {
        self.publish_progress(COPY_PROGRESS_START);

        let source = Database::open_plain(&paths.live)?;
        let mut target = match self.factory.create_keyed_store(&paths.temp, key) {
            Ok(db) => db,
            Err(e) => {
                let _ = source.close();
                return Err(e);
            }
        };

        let copied = self.copy_rows(&source, &mut target);
        let source_closed = source.close();
        let target_closed = target.close();

        let copied = copied?;
        source_closed?;
        target_closed?;
        Ok(copied)
    }

    fn copy_rows(
        &self,
        source: &Database,
        target: &mut Database,
    ) -> Result<Vec<(&'static str, i64)>> {
        let reader = Repository::new(source);
        let tx = target.transaction()?;
        let mut copied = Vec::with_capacity(DATA_TABLES.len());

        {
            let writer = Repository::from_conn(&tx);
            for (idx, table) in DATA_TABLES.iter().enumerate() {
                let rows = match *table {
                    "Category" => {
                        let rows = reader.all_categories()?;
                        writer.insert_categories(&rows)?;
                        rows.len()
                    }
                    "Task" => {
                        let rows = reader.all_tasks()?;
                        writer.insert_tasks(&rows)?;
                        rows.len()
                    }
                    other => {
                        return Err(Error::Migration(format!("No row copier for table {}", other)))
                    }
                };
                tracing::debug!("Copied {} rows from {}", rows, table);
                copied.push((*table, rows as i64));
                self.publish_progress(copy_progress(idx + 1, DATA_TABLES.len()));
            }
        }

        tx.commit()?;
        Ok(copied)
    }

    fn commit(&self, paths: &DbPaths, key: &DerivedKey) -> Result<()> {
        self.prefs.save_derived_key(key)?;
        self.cache.cache_key(key);
        self.prefs.set_encrypted(true)?;
        self.prefs.flags().clear_migration_marker()?;
        self.publish_progress(MigrationStep::Committed.progress());
        tracing::info!("Encryption committed");

        if let Err(e) = remove_database_files(&paths.backup) {
            tracing::warn!("Failed to delete plaintext backup, will retry on next start: {}", e);
        }
        Ok(())
    }

    /// Undo a failed attempt: drop the temp store, put the plaintext store back,
    /// forget the key and put the flag back to `was_encrypted`.
    fn cleanup_failed_migration(&self, paths: &DbPaths, was_encrypted: bool) {
        if let Err(e) = remove_database_files(&paths.temp) {
            tracing::warn!("Failed to delete temporary encrypted store: {}", e);
        }

        let mut restored = true;
        if paths.backup.exists() {
            match restore_backup(paths) {
                Ok(()) => tracing::info!("Restored plaintext store from backup"),
                Err(e) => {
                    restored = false;
                    tracing::error!("Failed to restore plaintext backup: {}", e);
                }
            }
        }

        self.cache.clear_cached_key();
        if let Err(e) = self.prefs.set_encrypted(was_encrypted) {
            tracing::error!("Failed to reset encryption flag: {}", e);
        }

        // Keep the marker when files are still out of place so startup retries
        if restored {
            if let Err(e) = self.prefs.flags().clear_migration_marker() {
                tracing::warn!("Failed to clear migration marker: {}", e);
            }
        }

        tracing::debug!("Failed migration cleanup completed");
    }

    /// Bring files and flags back to a consistent state after process death.
    pub fn recover_interrupted_migration(&self) -> Result<InterruptedMigration> {
        let marker = self.prefs.flags().load_migration_marker()?;
        let encrypted = self.prefs.is_encrypted()?;

        self.factory
            .with_exclusive_access(|paths| -> Result<InterruptedMigration> {
                match marker {
                    Some(marker) if !encrypted => {
                        tracing::warn!(
                            "Rolling back migration interrupted after step {} (started at {})",
                            marker.step.as_str(),
                            marker.started_at_ms
                        );
                        remove_database_files(&paths.temp)?;
                        if paths.backup.exists() {
                            restore_backup(paths)?;
                        }
                        self.cache.clear_cached_key();
                        self.prefs.flags().clear_migration_marker()?;
                        Ok(InterruptedMigration::RolledBack { step: marker.step })
                    }
                    Some(_) => {
                        tracing::info!("Finishing migration interrupted after commit");
                        remove_database_files(&paths.temp)?;
                        remove_database_files(&paths.backup)?;
                        self.prefs.flags().clear_migration_marker()?;
                        Ok(InterruptedMigration::Completed)
                    }
                    None => {
                        if paths.temp.exists() {
                            tracing::info!("Removing orphaned temporary store");
                            remove_database_files(&paths.temp)?;
                        }
                        if paths.backup.exists() {
                            if !encrypted && !paths.live.exists() {
                                tracing::warn!("Live store missing, restoring plaintext backup");
                                rename_database(&paths.backup, &paths.live)?;
                            } else {
                                tracing::info!("Removing stale plaintext backup");
                                remove_database_files(&paths.backup)?;
                            }
                        }
                        Ok(InterruptedMigration::None)
                    }
                }
            })
    }

    fn advance(&self, step: MigrationStep) -> Result<()> {
        self.prefs.flags().set_migration_step(step)?;
        self.publish_progress(step.progress());
        tracing::debug!("Migration step completed: {}", step.as_str());
        Ok(())
    }

    /// Progress never moves backwards within an attempt
    fn publish_progress(&self, value: u8) {
        self.progress.send_if_modified(|current| match *current {
            Some(previous) if previous >= value => false,
            _ => {
                *current = Some(value);
                true
            }
        });
    }
}

impl std::fmt::Debug for EncryptionMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMigrator")
            .field("progress", &*self.progress.borrow())
            .field("running", &self.is_running())
            .finish()
    }
}

fn already_encrypted() -> Error {
    Error::Migration("Database is already encrypted".to_string())
}

fn copy_progress(done: usize, total: usize) -> u8 {
    let span = usize::from(COPY_PROGRESS_END - COPY_PROGRESS_START);
    let step = if total == 0 { span } else { span * done / total };
    COPY_PROGRESS_START + step as u8
}

/// Reopen the temp store with the key and compare row counts with the source
fn verify_temp_store(paths: &DbPaths, key: &DerivedKey, expected: &[(&str, i64)]) -> Result<()> {
    if !Database::verify_key(&paths.temp, key) {
        return Err(Error::Migration(
            "Encrypted copy cannot be opened with the derived key".to_string(),
        ));
    }

    let db = Database::open_encrypted(&paths.temp, key)?;
    let checked = (|| -> Result<()> {
        let repo = Repository::new(&db);
        for (table, count) in expected {
            let actual = repo.count_rows(table)?;
            if actual != *count {
                return Err(Error::Migration(format!(
                    "Row count mismatch in {}: expected {}, found {}",
                    table, count, actual
                )));
            }
        }
        Ok(())
    })();
    let closed = db.close();
    checked?;
    closed?;
    tracing::debug!("Encrypted copy verified");
    Ok(())
}

/// Move live to backup, then temp to live. Puts live back if the second rename fails.
fn swap_files(paths: &DbPaths) -> Result<()> {
    rename_database(&paths.live, &paths.backup)?;
    tracing::debug!("Plaintext store moved to backup");

    if let Err(e) = rename_database(&paths.temp, &paths.live) {
        tracing::error!("Failed to move encrypted store into place: {}", e);
        rename_database(&paths.backup, &paths.live)?;
        return Err(Error::Migration(format!("rename failed: {}", e)));
    }

    tracing::info!("Encrypted store swapped into place");
    Ok(())
}

fn restore_backup(paths: &DbPaths) -> Result<()> {
    remove_database_files(&paths.live)?;
    rename_database(&paths.backup, &paths.live)
}
