//! Database access for the ingest service
//!
//! One SQLite database holds the shared cache tier, note progress, stage
//! flags and parsed ingredient lines.

pub mod units;

pub use units::{ParsedUnit, ParsedUnitStore, SavedUnit, SqliteUnitStore};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use larder_common::Result;

/// Open (creating if needed) the on-disk database and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database
///
/// The connection never idles out, since closing it would drop the database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create pipeline tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            stored_at TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            ttl_ms INTEGER NOT NULL,
            memory_ttl_ms INTEGER NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at_ms)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS note_progress (
            note_id TEXT PRIMARY KEY,
            total_units INTEGER,
            created_at TEXT NOT NULL,
            touched_at_ms INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS note_progress_units (
            note_id TEXT NOT NULL,
            line_id TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            PRIMARY KEY (note_id, line_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_flags (
            note_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            PRIMARY KEY (note_id, stage)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsed_ingredient_lines (
            id TEXT PRIMARY KEY,
            note_id TEXT NOT NULL,
            line_id TEXT NOT NULL,
            raw_line TEXT NOT NULL,
            rule TEXT NOT NULL,
            parse_result TEXT NOT NULL,
            saved_at TEXT NOT NULL,
            UNIQUE (note_id, line_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (cache_entries, note_progress, stage_flags, parsed_ingredient_lines)"
    );

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    init_memory_pool().await.unwrap()
}
