//! Encryption migration tests
//!
//! Tests cover:
//! - Known-answer vectors for the key derivation and phrase hash
//! - Migration of empty and populated stores
//! - Rollback when the row copy fails partway through
//! - Crash simulation between file swap and flag commit
//! - Legacy phrase storage upgrade on disk

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use taskfree_storage_sqlite::{
    Category, Database, DatabaseFactory, DerivedKey, EncryptionMigrator, EncryptionService,
    InterruptedMigration, JsonFileBackend, KeyCache, KeyValueBackend, MemoryBackend,
    MigrationStep, Prefs, RecoveryPhrase, Repository, StorageConfig, Task, TaskStatus,
};
use tempfile::TempDir;

const WORDS: &str = "orbit lemon quartz tiger maple canyon ivory spark";

fn phrase() -> RecoveryPhrase {
    RecoveryPhrase::parse(WORDS).unwrap()
}

fn service(dir: &TempDir, prefs: &Prefs) -> EncryptionService {
    EncryptionService::with_prefs(StorageConfig::with_data_dir(dir.path()), prefs.clone()).unwrap()
}

fn seed_rows(service: &EncryptionService) -> Vec<Task> {
    service
        .with_database(|db| {
            let repo = Repository::new(db);
            let work = repo.insert_category(&Category {
                id: 0,
                title: "Work".to_string(),
                color: 0xFF3F_51B5,
                category_page_order: 0,
            })?;
            let home = repo.insert_category(&Category {
                id: 0,
                title: "Home".to_string(),
                color: 0xFF4C_AF50,
                category_page_order: 1,
            })?;

            let mut report = Task::new(work, "Quarterly report", 0);
            report.status = TaskStatus::InProgress;
            repo.insert_task(&report)?;
            repo.insert_task(&Task::new(home, "Water plants", 0))?;
            repo.insert_task(&Task::new(home, "Fix the sink", 1))?;
            repo.all_tasks()
        })
        .unwrap()
}

/// Plaintext store whose Task.text column accepts NULL, so reading the
/// second task fails after the Category table has been copied.
fn seed_poisoned_store(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE schema_version (version INTEGER PRIMARY KEY);
        INSERT INTO schema_version (version) VALUES (1);
        CREATE TABLE Category (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            title TEXT NOT NULL,
            color INTEGER NOT NULL,
            categoryPageOrder INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE Task (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            categoryId INTEGER NOT NULL,
            text TEXT,
            due INTEGER,
            baseDate INTEGER,
            singleCategoryPageOrder INTEGER NOT NULL,
            allCategoryPageOrder INTEGER NOT NULL DEFAULT 0,
            completedDate INTEGER,
            recurrence TEXT NOT NULL DEFAULT 'NONE',
            status TEXT NOT NULL DEFAULT 'TODO',
            isArchived INTEGER NOT NULL DEFAULT 0,
            reminderTime INTEGER
        );
        INSERT INTO Category (title, color) VALUES ('Inbox', 1);
        INSERT INTO Task (categoryId, text, singleCategoryPageOrder) VALUES (1, 'fine', 0);
        INSERT INTO Task (categoryId, text, singleCategoryPageOrder) VALUES (1, NULL, 1);
        "#,
    )
    .unwrap();
}

fn leftover_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("_temp") || name.contains("_backup"))
        .collect()
}

// =============================================================================
// Known-answer vectors
// =============================================================================

#[test]
fn test_key_derivation_vector() {
    let key = DerivedKey::derive(&phrase());
    assert_eq!(
        hex::encode(key.as_bytes()),
        "46af360a6455e944b222a51e9b7f851c3d1a9cde5b2abfc7dee5b59e16c6c725"
    );
}

#[test]
fn test_phrase_hash_vector() {
    assert_eq!(
        phrase().hash().as_str(),
        "5b9090470b9bfe9a9f83af10dc7436fa8e0baf17c9560876b9c98ed0fed23313"
    );
}

// =============================================================================
// Successful migrations
// =============================================================================

#[tokio::test]
async fn test_migrate_empty_store() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let service = service(&dir, &prefs);
    let progress = service.progress();
    assert_eq!(*progress.borrow(), None);

    // Opening once creates an empty plaintext store
    service.with_database(|_| Ok(())).unwrap();

    service.begin_encryption(phrase()).await.unwrap();

    assert_eq!(*progress.borrow(), Some(100));
    assert!(service.error().borrow().is_none());
    assert!(prefs.is_encrypted().unwrap());

    let live = StorageConfig::with_data_dir(dir.path()).db_paths().live;
    let key = DerivedKey::derive(&phrase());
    assert!(Database::verify_key(&live, &key));
    assert!(Database::open_encrypted(&live, &key).is_ok());
    assert!(leftover_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_migrate_fresh_install_without_store() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let service = service(&dir, &prefs);

    service.begin_encryption(phrase()).await.unwrap();
    assert!(prefs.is_encrypted().unwrap());

    // Created encrypted on first open
    let encrypted = service.with_database(|db| Ok(db.is_encrypted())).unwrap();
    assert!(encrypted);
}

#[tokio::test]
async fn test_migrate_preserves_rows() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let service = service(&dir, &prefs);
    let before = seed_rows(&service);

    service.begin_encryption(phrase()).await.unwrap();

    let after = service
        .with_database(|db| {
            assert!(db.is_encrypted());
            Repository::new(db).all_tasks()
        })
        .unwrap();
    assert_eq!(after, before);

    service.close().unwrap();
    let live = StorageConfig::with_data_dir(dir.path()).db_paths().live;
    let raw = std::fs::read(&live).unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(!text.contains("Quarterly report"));
    assert!(Database::open_plain(&live).is_err());
}

#[tokio::test]
async fn test_second_migration_is_rejected_once_encrypted() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let service = service(&dir, &prefs);

    service.begin_encryption(phrase()).await.unwrap();
    assert!(service.begin_encryption(phrase()).await.is_err());

    // Still encrypted with the original key
    assert!(prefs.is_encrypted().unwrap());
    assert_eq!(
        prefs.load_derived_key().unwrap().unwrap(),
        DerivedKey::derive(&phrase())
    );
}

// =============================================================================
// Failure injection
// =============================================================================

#[tokio::test]
async fn test_failed_copy_rolls_back() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let paths = StorageConfig::with_data_dir(dir.path()).db_paths();
    seed_poisoned_store(&paths.live);

    let service = service(&dir, &prefs);
    let result = service.begin_encryption(phrase()).await;
    assert!(result.is_err());

    // Flag unchanged, no key cached or persisted for use
    assert!(!prefs.is_encrypted().unwrap());
    assert!(!service.has_key().unwrap());
    assert!(!service.needs_key_recovery().unwrap());
    assert!(prefs.flags().load_migration_marker().unwrap().is_none());

    let message = service.error().borrow().clone().unwrap();
    assert!(message.starts_with("Migration failed: "), "{}", message);
    assert_ne!(*service.progress().borrow(), Some(100));

    // Live store still there and readable without a key
    let db = Database::open_plain(&paths.live).unwrap();
    assert_eq!(Repository::new(&db).count_categories().unwrap(), 1);
    db.close().unwrap();

    // No partial artifacts
    assert!(!paths.temp.exists());
    assert!(!paths.backup.exists());
    assert!(leftover_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_retry_after_failure_uses_same_phrase() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let paths = StorageConfig::with_data_dir(dir.path()).db_paths();
    seed_poisoned_store(&paths.live);

    let service = service(&dir, &prefs);
    let generated = service.get_or_create_phrase().unwrap();
    assert!(service.begin_encryption(generated.clone()).await.is_err());

    // Repair the bad row, then retry
    {
        let conn = Connection::open(&paths.live).unwrap();
        conn.execute("UPDATE Task SET text = 'repaired' WHERE text IS NULL", [])
            .unwrap();
    }
    let again = service.get_or_create_phrase().unwrap();
    assert_eq!(again.words(), generated.words());

    service.begin_encryption(again).await.unwrap();
    assert!(prefs.is_encrypted().unwrap());
    assert!(service.error().borrow().is_none());
    let count = service
        .with_database(|db| Repository::new(db).count_tasks())
        .unwrap();
    assert_eq!(count, 2);
}

// =============================================================================
// Crash simulation
// =============================================================================

#[test]
fn test_crash_between_swap_and_commit_reads_as_unencrypted() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let paths = StorageConfig::with_data_dir(dir.path()).db_paths();
    let key = DerivedKey::derive(&phrase());

    // Plaintext original parked at the backup path
    {
        let db = Database::open_plain(&paths.backup).unwrap();
        db.conn()
            .execute("INSERT INTO Category (title, color) VALUES ('Kept', 1)", [])
            .unwrap();
        db.close().unwrap();
    }
    // Encrypted copy already swapped into the live path
    Database::create_keyed(&paths.live, &key).unwrap().close().unwrap();

    prefs.flags().begin_migration_marker(1_700_000_000_000).unwrap();
    prefs.flags().set_migration_step(MigrationStep::Swapped).unwrap();

    // Process restarts
    let service = service(&dir, &prefs);

    assert!(!service.is_encrypted().unwrap());
    assert!(!service.needs_key_recovery().unwrap());
    assert!(prefs.flags().load_migration_marker().unwrap().is_none());
    assert!(!paths.backup.exists());

    let titles = service
        .with_database(|db| {
            assert!(!db.is_encrypted());
            Repository::new(db).all_categories()
        })
        .unwrap();
    assert_eq!(titles.len(), 1);
    assert_eq!(titles[0].title, "Kept");
}

#[test]
fn test_crash_after_commit_finishes_cleanup() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let paths = StorageConfig::with_data_dir(dir.path()).db_paths();
    let key = DerivedKey::derive(&phrase());

    Database::open_plain(&paths.backup).unwrap().close().unwrap();
    Database::create_keyed(&paths.live, &key).unwrap().close().unwrap();
    prefs.flags().begin_migration_marker(1).unwrap();
    prefs.flags().set_migration_step(MigrationStep::Swapped).unwrap();
    prefs.save_derived_key(&key).unwrap();
    prefs.set_encrypted(true).unwrap();

    let service = service(&dir, &prefs);

    assert!(service.is_encrypted().unwrap());
    assert!(!paths.backup.exists());
    assert!(prefs.flags().load_migration_marker().unwrap().is_none());
    assert!(service.with_database(|db| Ok(db.is_encrypted())).unwrap());
}

#[test]
fn test_crash_during_copy_discards_temp() {
    let dir = TempDir::new().unwrap();
    let prefs = Prefs::in_memory();
    let cache = Arc::new(KeyCache::new());
    let paths = StorageConfig::with_data_dir(dir.path()).db_paths();

    Database::open_plain(&paths.live).unwrap().close().unwrap();
    Database::create_keyed(&paths.temp, &DerivedKey::derive(&phrase()))
        .unwrap()
        .close()
        .unwrap();
    prefs.flags().begin_migration_marker(1).unwrap();
    prefs
        .flags()
        .set_migration_step(MigrationStep::ConnectionsClosed)
        .unwrap();

    let factory = Arc::new(DatabaseFactory::new(
        paths.clone(),
        prefs.clone(),
        cache.clone(),
    ));
    let migrator = EncryptionMigrator::new(factory, prefs.clone(), cache);

    assert_eq!(
        migrator.recover_interrupted_migration().unwrap(),
        InterruptedMigration::RolledBack {
            step: MigrationStep::ConnectionsClosed
        }
    );
    assert!(!paths.temp.exists());
    assert!(Database::open_plain(&paths.live).is_ok());
}

// =============================================================================
// Phrase storage
// =============================================================================

#[test]
fn test_get_or_create_twice_returns_same_phrase() {
    let dir = TempDir::new().unwrap();
    let service = EncryptionService::open(StorageConfig::with_data_dir(dir.path())).unwrap();

    let first = service.get_or_create_phrase().unwrap();
    let second = service.get_or_create_phrase().unwrap();
    assert_eq!(first.words(), second.words());

    drop(service);
    let reopened = EncryptionService::open(StorageConfig::with_data_dir(dir.path())).unwrap();
    assert_eq!(reopened.get_or_create_phrase().unwrap().words(), first.words());
}

#[test]
fn test_legacy_phrase_file_is_upgraded() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig::with_data_dir(dir.path());
    std::fs::write(
        config.secret_path(),
        br#"{ "phraseWords": ["a", "b", "c", "d", "e", "f", "g", "h"] }"#,
    )
    .unwrap();

    let prefs = Prefs::open(&config).unwrap();
    let first = prefs.load_phrase().unwrap().unwrap();
    for _ in 0..5 {
        assert_eq!(prefs.load_phrase().unwrap().unwrap().words(), first.words());
    }

    // Stored in the ordered string form now
    let backend = JsonFileBackend::open(config.secret_path()).unwrap();
    let stored = backend.get("phraseWords").unwrap().unwrap();
    assert_eq!(stored.as_str(), Some(first.joined(" ").as_str()));
}

#[test]
fn test_secrets_stay_out_of_flags_namespace() {
    let flags = Arc::new(MemoryBackend::new());
    let secret = Arc::new(MemoryBackend::new());
    let prefs = Prefs::new(flags.clone(), secret.clone());
    let dir = TempDir::new().unwrap();
    let service = service(&dir, &prefs);

    service.get_or_create_phrase().unwrap();
    assert!(flags.get("phraseHash").unwrap().is_some());
    assert!(flags.get("phraseWords").unwrap().is_none());
    assert!(secret.get("phraseWords").unwrap().is_some());
}
