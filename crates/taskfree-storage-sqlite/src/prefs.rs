//! Secret storage gateway
//!
//! Two physically separate key-value namespaces:
//! - [`NonSecretStore`]: encryption flag, phrase hash and the migration marker.
//!   Eligible for device backup.
//! - [`SecretStore`]: recovery phrase and derived key. Must be excluded from
//!   any backup.
//!
//! Both sit on a [`KeyValueBackend`]; production uses one JSON file per
//! namespace, tests use [`MemoryBackend`].

use crate::config::StorageConfig;
use crate::encryption::DerivedKey;
use crate::migrator::MigrationStep;
use crate::phrase::{PhraseHash, RecoveryPhrase};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

const KEY_ENCRYPTED: &str = "encrypted";
const KEY_IN_PROGRESS: &str = "migrationInProgress";
const KEY_START_EPOCH: &str = "migrationStartEpoch";
const KEY_MIGRATION_STEP: &str = "migrationStep";
const KEY_PHRASE_HASH: &str = "phraseHash";
const KEY_PHRASE: &str = "phraseWords";
const KEY_DERIVED_KEY: &str = "derived_key";

/// Persistence backend for one namespace
pub trait KeyValueBackend: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value
    fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Remove the given keys (missing keys are ignored)
    fn remove(&self, keys: &[&str]) -> Result<()>;

    /// Remove everything
    fn clear(&self) -> Result<()>;
}

/// In-memory backend for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: RwLock<Map<String, Value>>,
}

impl MemoryBackend {
    /// Create empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.map.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut map = self.map.write();
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.map.write().clear();
        Ok(())
    }
}

/// JSON-object file backend.
///
/// Every mutation rewrites the whole file through a temp file in the same
/// directory followed by a rename, so readers see either the old or the new
/// contents. Temp files are created owner-only (0600 on unix) and keep that
/// mode after the rename.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    map: RwLock<Map<String, Value>>,
}

impl JsonFileBackend {
    /// Open (or lazily create) the file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => map,
                _ => {
                    return Err(Error::Storage(format!(
                        "Preferences file {} is not a JSON object",
                        path.display()
                    )))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &Map<String, Value>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let bytes = Zeroizing::new(serde_json::to_vec_pretty(map)?);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl KeyValueBackend for JsonFileBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut map = self.map.write();
        map.insert(key.to_string(), value);
        self.persist(&map)
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut map = self.map.write();
        let mut changed = false;
        for key in keys {
            changed |= map.remove(*key).is_some();
        }
        if changed {
            self.persist(&map)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut map = self.map.write();
        map.clear();
        self.persist(&map)
    }
}

/// Persisted "migration in progress" marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationMarker {
    /// Last step that fully completed
    pub step: MigrationStep,
    /// When the attempt started (unix millis)
    pub started_at_ms: i64,
}

/// Backup-eligible namespace
#[derive(Clone)]
pub struct NonSecretStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl NonSecretStore {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Encryption flag (defaults to false)
    pub fn is_encrypted(&self) -> Result<bool> {
        Ok(self
            .backend
            .get(KEY_ENCRYPTED)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Set encryption flag
    pub fn set_encrypted(&self, encrypted: bool) -> Result<()> {
        self.backend.put(KEY_ENCRYPTED, Value::Bool(encrypted))
    }

    /// Stored phrase hash
    pub fn load_phrase_hash(&self) -> Result<Option<PhraseHash>> {
        Ok(self
            .backend
            .get(KEY_PHRASE_HASH)?
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.trim().is_empty())
            .map(PhraseHash::from_hex))
    }

    /// Store phrase hash
    pub fn save_phrase_hash(&self, hash: &PhraseHash) -> Result<()> {
        self.backend
            .put(KEY_PHRASE_HASH, Value::String(hash.as_str().to_string()))
    }

    /// Read the migration marker, if an attempt is recorded
    pub fn load_migration_marker(&self) -> Result<Option<MigrationMarker>> {
        let in_progress = self
            .backend
            .get(KEY_IN_PROGRESS)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !in_progress {
            return Ok(None);
        }

        let started_at_ms = self
            .backend
            .get(KEY_START_EPOCH)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let step = self
            .backend
            .get(KEY_MIGRATION_STEP)?
            .and_then(|v| v.as_str().and_then(MigrationStep::parse))
            .unwrap_or(MigrationStep::Idle);

        Ok(Some(MigrationMarker { step, started_at_ms }))
    }

    /// Record that a migration attempt has started
    pub fn begin_migration_marker(&self, started_at_ms: i64) -> Result<()> {
        self.backend.put(KEY_START_EPOCH, Value::from(started_at_ms))?;
        self.backend.put(
            KEY_MIGRATION_STEP,
            Value::String(MigrationStep::Idle.as_str().to_string()),
        )?;
        self.backend.put(KEY_IN_PROGRESS, Value::Bool(true))
    }

    /// Advance the last-completed step
    pub fn set_migration_step(&self, step: MigrationStep) -> Result<()> {
        self.backend
            .put(KEY_MIGRATION_STEP, Value::String(step.as_str().to_string()))
    }

    /// Remove the migration marker
    pub fn clear_migration_marker(&self) -> Result<()> {
        self.backend
            .remove(&[KEY_IN_PROGRESS, KEY_START_EPOCH, KEY_MIGRATION_STEP])
    }

    /// Remove encryption-related flags (flag, marker, hash)
    pub fn clear_encryption(&self) -> Result<()> {
        self.backend.remove(&[
            KEY_ENCRYPTED,
            KEY_IN_PROGRESS,
            KEY_START_EPOCH,
            KEY_MIGRATION_STEP,
            KEY_PHRASE_HASH,
        ])
    }
}

/// Result of decoding a stored phrase value
#[derive(Debug)]
pub enum DecodedPhrase {
    /// Ordered space-delimited string
    Current(RecoveryPhrase),
    /// Legacy unordered collection; must be re-encoded
    Legacy(RecoveryPhrase),
}

/// Decode a stored phrase value.
///
/// Attempts the current ordered-string format first, then the legacy
/// unordered array. Blank values decode to `None`.
pub fn decode_stored_phrase(value: &Value) -> Result<Option<DecodedPhrase>> {
    match value {
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(DecodedPhrase::Current(RecoveryPhrase::from_words(
            s.split(' '),
        )?))),
        Value::Array(items) => {
            let words = items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        Error::Storage("Legacy phrase contains a non-string entry".to_string())
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(DecodedPhrase::Legacy(RecoveryPhrase::from_words(words)?)))
        }
        Value::Null => Ok(None),
        _ => Err(Error::Storage("Unrecognized stored phrase format".to_string())),
    }
}

/// Encode a phrase in the current ordered format
pub fn encode_phrase(phrase: &RecoveryPhrase) -> Value {
    Value::String(phrase.joined(" "))
}

/// Backup-excluded namespace
#[derive(Clone)]
pub struct SecretStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl SecretStore {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Store the phrase as an ordered, space-delimited string
    pub fn save_phrase(&self, phrase: &RecoveryPhrase) -> Result<()> {
        self.backend.put(KEY_PHRASE, encode_phrase(phrase))
    }

    /// Load the phrase, upgrading the legacy unordered format in place
    pub fn load_phrase(&self) -> Result<Option<RecoveryPhrase>> {
        let Some(value) = self.backend.get(KEY_PHRASE)? else {
            return Ok(None);
        };

        match decode_stored_phrase(&value)? {
            None => Ok(None),
            Some(DecodedPhrase::Current(phrase)) => Ok(Some(phrase)),
            Some(DecodedPhrase::Legacy(phrase)) => {
                tracing::info!("Upgrading legacy unordered recovery phrase storage");
                self.save_phrase(&phrase)?;
                Ok(Some(phrase))
            }
        }
    }

    /// Persist the derived key (base64)
    pub fn save_derived_key(&self, key: &DerivedKey) -> Result<()> {
        let encoded = key.to_base64();
        self.backend
            .put(KEY_DERIVED_KEY, Value::String(encoded.as_str().to_string()))
    }

    /// Load the persisted derived key
    pub fn load_derived_key(&self) -> Result<Option<DerivedKey>> {
        match self.backend.get(KEY_DERIVED_KEY)? {
            Some(Value::String(encoded)) => {
                let encoded = Zeroizing::new(encoded);
                Ok(Some(DerivedKey::from_base64(&encoded)?))
            }
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(Error::Storage("Stored key has unexpected type".to_string())),
        }
    }

    /// Remove all secrets
    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }
}

/// Gateway over both namespaces
#[derive(Clone)]
pub struct Prefs {
    flags: NonSecretStore,
    secret: SecretStore,
}

impl Prefs {
    /// Build from two distinct backends
    pub fn new(flags: Arc<dyn KeyValueBackend>, secret: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            flags: NonSecretStore::new(flags),
            secret: SecretStore::new(secret),
        }
    }

    /// Open the JSON-file namespaces named in `config`
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let flags = JsonFileBackend::open(config.flags_path())?;
        let secret = JsonFileBackend::open(config.secret_path())?;
        Ok(Self::new(Arc::new(flags), Arc::new(secret)))
    }

    /// Ephemeral in-memory namespaces
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(MemoryBackend::new()))
    }

    /// Backup-eligible namespace
    pub fn flags(&self) -> &NonSecretStore {
        &self.flags
    }

    /// Backup-excluded namespace
    pub fn secret(&self) -> &SecretStore {
        &self.secret
    }

    /// Encryption flag
    pub fn is_encrypted(&self) -> Result<bool> {
        self.flags.is_encrypted()
    }

    /// Set encryption flag
    pub fn set_encrypted(&self, encrypted: bool) -> Result<()> {
        self.flags.set_encrypted(encrypted)
    }

    /// Store phrase (secret)
    pub fn save_phrase(&self, phrase: &RecoveryPhrase) -> Result<()> {
        self.secret.save_phrase(phrase)
    }

    /// Load phrase (secret), upgrading legacy storage
    pub fn load_phrase(&self) -> Result<Option<RecoveryPhrase>> {
        self.secret.load_phrase()
    }

    /// Store phrase hash (non-secret)
    pub fn save_phrase_hash(&self, hash: &PhraseHash) -> Result<()> {
        self.flags.save_phrase_hash(hash)
    }

    /// Load phrase hash (non-secret)
    pub fn load_phrase_hash(&self) -> Result<Option<PhraseHash>> {
        self.flags.load_phrase_hash()
    }

    /// Store derived key (secret)
    pub fn save_derived_key(&self, key: &DerivedKey) -> Result<()> {
        self.secret.save_derived_key(key)
    }

    /// Load derived key (secret)
    pub fn load_derived_key(&self) -> Result<Option<DerivedKey>> {
        self.secret.load_derived_key()
    }

    /// Remove non-secret encryption fields only
    pub fn clear_encryption(&self) -> Result<()> {
        self.flags.clear_encryption()
    }

    /// Remove the secret namespace contents only
    pub fn clear_encryption_secrets(&self) -> Result<()> {
        self.secret.clear()
    }
}
