//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage error (generic)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store is marked encrypted but no key is available in cache or secret storage
    #[error("Database is locked: no encryption key available")]
    Locked,

    /// Another migration is already running in this process
    #[error("An encryption migration is already in progress")]
    MigrationInProgress,

    /// Recovery flow transition not allowed from the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Short message suitable for the observable migration error channel
    pub fn user_message(&self) -> String {
        match self {
            Error::Locked => "The database is locked. Enter your recovery phrase to unlock it.".to_string(),
            Error::MigrationInProgress => "Encryption is already running.".to_string(),
            Error::Database(e) => e.to_string(),
            Error::Io(e) => e.to_string(),
            Error::Serialization(e) => e.to_string(),
            Error::Encryption(msg)
            | Error::Migration(msg)
            | Error::Validation(msg)
            | Error::Storage(msg)
            | Error::Config(msg)
            | Error::InvalidState(msg) => msg.clone(),
        }
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
