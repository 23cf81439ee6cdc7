//! SQLite-backed shared cache tier
//!
//! Rows live in `cache_entries` (created by `db::init_tables`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::time::Duration;

use super::{CacheEntry, SharedStore};
use larder_common::{Error, Result};

pub struct SqliteSharedStore {
    pool: SqlitePool,
}

impl SqliteSharedStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<CacheEntry> {
    let value: String = row.get("value");
    let stored_at: String = row.get("stored_at");
    let ttl_ms: i64 = row.get("ttl_ms");
    let memory_ttl_ms: i64 = row.get("memory_ttl_ms");
    let tags: String = row.get("tags");

    let stored_at = DateTime::parse_from_rfc3339(&stored_at)
        .map_err(|e| Error::Internal(format!("Failed to parse stored_at: {}", e)))?
        .with_timezone(&Utc);

    Ok(CacheEntry {
        key: row.get("key"),
        value: serde_json::from_str(&value)?,
        stored_at,
        ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        memory_ttl: Duration::from_millis(memory_ttl_ms.max(0) as u64),
        tags: serde_json::from_str::<BTreeSet<String>>(&tags)?,
    })
}

#[async_trait]
impl SharedStore for SqliteSharedStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT key, value, stored_at, ttl_ms, memory_ttl_ms, tags
            FROM cache_entries
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        let value = serde_json::to_string(&entry.value)?;
        let tags = serde_json::to_string(&entry.tags)?;
        let expires_at_ms = entry.expires_at().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO cache_entries (
                key, value, stored_at, expires_at_ms, ttl_ms, memory_ttl_ms, tags
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                stored_at = excluded.stored_at,
                expires_at_ms = excluded.expires_at_ms,
                ttl_ms = excluded.ttl_ms,
                memory_ttl_ms = excluded.memory_ttl_ms,
                tags = excluded.tags
            "#,
        )
        .bind(&entry.key)
        .bind(&value)
        .bind(entry.stored_at.to_rfc3339())
        .bind(expires_at_ms)
        .bind(duration_ms(entry.ttl))
        .bind(duration_ms(entry.memory_ttl))
        .bind(&tags)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        // substr comparison rather than LIKE: LIKE is case-insensitive and treats % and _ specially
        let keys = sqlx::query_scalar::<_, String>(
            "DELETE FROM cache_entries WHERE substr(key, 1, length(?)) = ? RETURNING key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn delete_tag(&self, tag: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM cache_entries
            WHERE EXISTS (
                SELECT 1 FROM json_each(cache_entries.tags) WHERE json_each.value = ?
            )
            RETURNING key
            "#,
        )
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at_ms <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn len(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE expires_at_ms > ?")
                .bind(Utc::now().timestamp_millis())
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }
}
