//! Encrypted SQLite storage for TaskFree
//!
//! At-rest encryption for the task database: a recovery phrase is turned
//! into a SQLCipher key, the existing plaintext store is migrated into an
//! encrypted one with an atomic file swap, and a recovery flow unlocks the
//! store again when the key is lost.
//!
//! ## Components
//!
//! - **Key Derivation**: PBKDF2-HMAC-SHA256, fixed salt, 100,000 iterations, 256-bit key
//! - **Key Cache**: Injectable, zeroized-on-clear in-memory slot
//! - **Recovery Phrase**: Eight ordered BIP-39 English words plus a SHA-256 hash for validation
//! - **Secret Storage**: Backup-eligible flags kept apart from backup-excluded secrets
//! - **Migrator**: Copy, verify, swap, commit; rolls back on failure and after process death
//! - **Recovery Flow**: Prompt / entry / unlocked / wiped state machine

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod database;
pub mod encryption;
pub mod error;
pub mod factory;
pub mod key_cache;
pub mod migrations;
pub mod migrator;
pub mod mnemonic;
pub mod models;
pub mod phrase;
pub mod prefs;
pub mod recovery;
pub mod repository;
pub mod service;

pub use config::{DbPaths, StorageConfig, DATA_DIR_ENV};
pub use database::Database;
pub use encryption::{DerivedKey, KDF_ITERATIONS, KDF_SALT, KEY_LENGTH};
pub use error::{Error, Result};
pub use factory::DatabaseFactory;
pub use key_cache::KeyCache;
pub use migrator::{EncryptionMigrator, InterruptedMigration, MigrationStep};
pub use mnemonic::MnemonicManager;
pub use models::*;
pub use phrase::{format_mnemonic, PhraseHash, RecoveryPhrase, PHRASE_WORD_COUNT};
pub use prefs::{
    JsonFileBackend, KeyValueBackend, MemoryBackend, MigrationMarker, NonSecretStore, Prefs,
    SecretStore,
};
pub use recovery::{KeyRecoveryFlow, RecoveryState};
pub use repository::Repository;
pub use service::EncryptionService;
