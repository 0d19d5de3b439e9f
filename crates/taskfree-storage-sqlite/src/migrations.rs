//! Database schema migrations

use crate::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Tables copied during an encryption migration, parent tables first
pub const DATA_TABLES: [&str; 2] = ["Category", "Task"];

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::debug!(
        "Running migrations: current_version={}, target_version={}",
        current_version,
        SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version != SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Read the schema version (0 for a fresh database)
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tracing::debug!("Schema version set to {}", version);
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS `Category` (
            `id`                INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            `title`             TEXT    NOT NULL,
            `color`             INTEGER NOT NULL,
            `categoryPageOrder` INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS `Task` (
            `id`                      INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            `categoryId`              INTEGER NOT NULL,
            `text`                    TEXT    NOT NULL,
            `due`                     INTEGER,
            `baseDate`                INTEGER,
            `singleCategoryPageOrder` INTEGER NOT NULL,
            `allCategoryPageOrder`    INTEGER NOT NULL DEFAULT 0,
            `completedDate`           INTEGER,
            `recurrence`              TEXT    NOT NULL DEFAULT 'NONE',
            `status`                  TEXT    NOT NULL DEFAULT 'TODO',
            `isArchived`              INTEGER NOT NULL DEFAULT 0,
            `reminderTime`            INTEGER,
            FOREIGN KEY(`categoryId`) REFERENCES `Category`(`id`) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS `index_Task_categoryId` ON `Task` (`categoryId`);
        "#,
    )?;
    Ok(())
}
