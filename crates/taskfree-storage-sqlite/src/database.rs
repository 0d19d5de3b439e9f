//! Database connection and initialization

use crate::{encryption::DerivedKey, migrations, Error, Result};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};

/// SQLite sidecar suffixes that belong to a database file
const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Database connection wrapper
pub struct Database {
    conn: Connection,
    path: PathBuf,
    encrypted: bool,
}

impl Database {
    /// Open the database at `path`, keyed when `key` is given.
    ///
    /// A missing file is created (encrypted from the first page when keyed).
    pub fn open<P: AsRef<Path>>(path: P, key: Option<&DerivedKey>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let db_exists = path_buf.exists();

        let conn = Connection::open_with_flags(
            &path_buf,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // PRAGMA key MUST be the first statement on the connection, otherwise a
        // new file is created unencrypted.
        if let Some(key) = key {
            apply_key(&conn, key)?;
            verify_cipher(&conn)?;
        }

        if db_exists {
            check_readable(&conn, &path_buf, key.is_some())?;
        }

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrations::run_migrations(&conn)?;

        tracing::debug!(
            "Opened {} database at {}",
            if key.is_some() { "encrypted" } else { "plaintext" },
            path_buf.display()
        );

        Ok(Self {
            conn,
            path: path_buf,
            encrypted: key.is_some(),
        })
    }

    /// Open an unkeyed database
    pub fn open_plain<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, None)
    }

    /// Open a keyed database
    pub fn open_encrypted<P: AsRef<Path>>(path: P, key: &DerivedKey) -> Result<Self> {
        Self::open(path, Some(key))
    }

    /// Build a brand-new keyed database at `path`, replacing any leftover file
    pub fn create_keyed<P: AsRef<Path>>(path: P, key: &DerivedKey) -> Result<Self> {
        remove_database_files(path.as_ref())?;
        Self::open_encrypted(path, key)
    }

    /// Check that `key` opens the database at `path` read-only.
    ///
    /// A missing file counts as valid: it will be created with this key.
    pub fn verify_key<P: AsRef<Path>>(path: P, key: &DerivedKey) -> bool {
        let path = path.as_ref();
        if !path.exists() {
            return true;
        }

        let result = (|| -> Result<()> {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            apply_key(&conn, key)?;
            conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                tracing::debug!("Key verification succeeded for {}", path.display());
                true
            }
            Err(e) => {
                tracing::warn!("Key verification failed for {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Get connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this connection was opened with a key
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Begin transaction
    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    /// Checkpoint the WAL into the main file and close the connection
    pub fn close(self) -> Result<()> {
        if let Err(e) = self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!("WAL checkpoint before close failed: {}", e);
        }
        self.conn.close().map_err(|(_, e)| Error::Database(e))
    }
}

fn apply_key(conn: &Connection, key: &DerivedKey) -> Result<()> {
    let literal = key.sqlcipher_literal();
    conn.execute_batch(&format!("PRAGMA key = \"{}\";", literal.as_str()))
        .map_err(|e| Error::Encryption(format!("Failed to set database encryption key: {}", e)))
}

fn verify_cipher(conn: &Connection) -> Result<()> {
    let cipher_version: std::result::Result<String, rusqlite::Error> =
        conn.query_row("PRAGMA cipher_version", [], |row| row.get(0));

    match cipher_version {
        Ok(version) if !version.is_empty() => {
            tracing::debug!("SQLCipher version: {}", version);
            Ok(())
        }
        Ok(_) | Err(_) => Err(Error::Encryption(
            "SQLCipher encryption verification failed. Database may not be encrypted.".to_string(),
        )),
    }
}

fn check_readable(conn: &Connection, path: &Path, keyed: bool) -> Result<()> {
    let test_result: std::result::Result<i64, rusqlite::Error> =
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0));

    match test_result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::NotADatabase => {
            let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if file_size < 100 {
                tracing::warn!(
                    "Database file exists but is too small ({} bytes), may be corrupted",
                    file_size
                );
                return Err(Error::Encryption(
                    "Database file appears to be corrupted.".to_string(),
                ));
            }
            Err(Error::Encryption(if keyed {
                "Cannot read encrypted database: wrong key or not an encrypted database.".to_string()
            } else {
                "Cannot read database without a key: it is encrypted or corrupted.".to_string()
            }))
        }
        Err(e) => Err(e.into()),
    }
}

/// Path with a sidecar suffix appended (`foo.db` -> `foo.db-wal`)
fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Delete a database file and its sidecars; missing files are ignored
pub fn remove_database_files(path: &Path) -> Result<()> {
    remove_if_exists(path)?;
    for suffix in SIDECAR_SUFFIXES {
        remove_if_exists(&sidecar_path(path, suffix))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Rename a database file together with any sidecars, dropping stale
/// sidecars left under the target name
pub fn rename_database(from: &Path, to: &Path) -> Result<()> {
    for suffix in SIDECAR_SUFFIXES {
        remove_if_exists(&sidecar_path(to, suffix))?;
    }
    std::fs::rename(from, to)?;
    for suffix in SIDECAR_SUFFIXES {
        let sidecar = sidecar_path(from, suffix);
        if sidecar.exists() {
            std::fs::rename(&sidecar, sidecar_path(to, suffix))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(byte: u8) -> DerivedKey {
        DerivedKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_open_plain_database() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_plain(dir.path().join("plain.db")).unwrap();
        assert!(!db.is_encrypted());
        db.close().unwrap();
    }

    #[test]
    fn test_sqlcipher_verification() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_encrypted(dir.path().join("enc.db"), &key(1)).unwrap();

        let version: String = db
            .conn()
            .query_row("PRAGMA cipher_version", [], |row| row.get(0))
            .unwrap();
        assert!(!version.is_empty(), "SQLCipher version should be non-empty");
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.db");
        let db = Database::open_encrypted(&path, &key(1)).unwrap();
        db.conn()
            .execute("INSERT INTO Category (title, color) VALUES ('Work', 5)", [])
            .unwrap();
        db.close().unwrap();

        assert!(Database::open_encrypted(&path, &key(2)).is_err());
        assert!(Database::open_plain(&path).is_err());
        assert!(Database::open_encrypted(&path, &key(1)).is_ok());
    }

    #[test]
    fn test_database_file_is_encrypted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.db");
        let db = Database::open_encrypted(&path, &key(7)).unwrap();
        db.conn()
            .execute(
                "INSERT INTO Category (title, color) VALUES ('sensitive data', 5)",
                [],
            )
            .unwrap();
        db.close().unwrap();

        let contents = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&contents);
        assert!(!text.contains("sensitive data"));
        assert!(!text.contains("SQLite format 3"));
    }

    #[test]
    fn test_verify_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.db");
        assert!(Database::verify_key(&path, &key(3)));

        Database::open_encrypted(&path, &key(3)).unwrap().close().unwrap();
        assert!(Database::verify_key(&path, &key(3)));
        assert!(!Database::verify_key(&path, &key(4)));
    }

    #[test]
    fn test_create_keyed_replaces_leftovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp.db");
        std::fs::write(&path, b"garbage from an earlier attempt").unwrap();

        let db = Database::create_keyed(&path, &key(5)).unwrap();
        assert!(db.is_encrypted());
    }

    #[test]
    fn test_close_leaves_no_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.db");
        let db = Database::open_plain(&path).unwrap();
        db.conn()
            .execute("INSERT INTO Category (title, color) VALUES ('x', 1)", [])
            .unwrap();
        db.close().unwrap();

        assert!(!sidecar_path(&path, "-wal").exists());
    }

    #[test]
    fn test_remove_and_rename_helpers() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(sidecar_path(&a, "-wal"), b"wal").unwrap();
        std::fs::write(sidecar_path(&b, "-shm"), b"stale").unwrap();

        rename_database(&a, &b).unwrap();
        assert!(!a.exists());
        assert!(b.exists());
        assert!(!sidecar_path(&a, "-wal").exists());
        assert!(sidecar_path(&b, "-wal").exists());
        assert!(!sidecar_path(&b, "-shm").exists());

        remove_database_files(&b).unwrap();
        assert!(!b.exists());
        assert!(!sidecar_path(&b, "-wal").exists());
        // Missing files are fine
        remove_database_files(&b).unwrap();
    }
}
