//! Progress store shared between processes through SQLite
//!
//! Each mutation is one conditional statement inside a transaction, so two
//! workers marking the same note cannot overshoot the registered total.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use larder_common::{Error, Result};

use super::{MarkOutcome, NoteStatus, ProgressStore};
use crate::utils::retry_on_lock;

const MAX_LOCK_WAIT: Duration = Duration::from_secs(5);

pub struct SqliteProgressStore {
    pool: SqlitePool,
}

impl SqliteProgressStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn read_status(&self, note_id: &str) -> Result<NoteStatus> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT total_units FROM note_progress WHERE note_id = ?1) AS total_units,
                (SELECT COUNT(*) FROM note_progress_units WHERE note_id = ?1) AS completed
            "#,
        )
        .bind(note_id)
        .fetch_one(&self.pool)
        .await?;

        let total: Option<i64> = row.get("total_units");
        let completed: i64 = row.get("completed");
        Ok(NoteStatus::new(
            completed.max(0) as u64,
            total.map(|t| t.max(0) as u64),
        ))
    }

    async fn register_once(&self, note_id: &str, total: u64) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO note_progress (note_id, total_units, created_at, touched_at_ms)
            VALUES (?, NULL, ?, ?)
            ON CONFLICT(note_id) DO UPDATE SET touched_at_ms = excluded.touched_at_ms
            "#,
        )
        .bind(note_id)
        .bind(now.to_rfc3339())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE note_progress SET total_units = ?2
            WHERE note_id = ?1
              AND total_units IS NULL
              AND (SELECT COUNT(*) FROM note_progress_units WHERE note_id = ?1) <= ?2
            "#,
        )
        .bind(note_id)
        .bind(total as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row = sqlx::query(
            r#"
            SELECT
                total_units,
                (SELECT COUNT(*) FROM note_progress_units WHERE note_id = ?1) AS completed
            FROM note_progress WHERE note_id = ?1
            "#,
        )
        .bind(note_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        if updated == 1 {
            return Ok(());
        }

        let registered: Option<i64> = row.get("total_units");
        let completed: i64 = row.get("completed");
        match registered.map(|r| r as u64) {
            Some(registered) if registered == total => Ok(()),
            Some(registered) => Err(Error::ExpectedCountMismatch {
                note_id: note_id.to_string(),
                registered,
                requested: total,
            }),
            None => Err(Error::InvalidInput(format!(
                "Note {} already has {} completed units, cannot expect {}",
                note_id, completed, total
            ))),
        }
    }

    async fn mark_once(&self, note_id: &str, line_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO note_progress (note_id, total_units, created_at, touched_at_ms)
            VALUES (?, NULL, ?, ?)
            ON CONFLICT(note_id) DO UPDATE SET touched_at_ms = excluded.touched_at_ms
            "#,
        )
        .bind(note_id)
        .bind(now.to_rfc3339())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO note_progress_units (note_id, line_id, completed_at)
            SELECT ?1, ?2, ?3
            WHERE (SELECT total_units FROM note_progress WHERE note_id = ?1) IS NULL
               OR (SELECT COUNT(*) FROM note_progress_units WHERE note_id = ?1)
                  < (SELECT total_units FROM note_progress WHERE note_id = ?1)
            "#,
        )
        .bind(note_id)
        .bind(line_id)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            return Ok(true);
        }

        let row = sqlx::query(
            r#"
            SELECT
                EXISTS(SELECT 1 FROM note_progress_units WHERE note_id = ?1 AND line_id = ?2) AS present,
                (SELECT total_units FROM note_progress WHERE note_id = ?1) AS total_units
            "#,
        )
        .bind(note_id)
        .bind(line_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let present: i64 = row.get("present");
        if present != 0 {
            return Ok(false);
        }

        let total: Option<i64> = row.get("total_units");
        Err(Error::UnitOverflow {
            note_id: note_id.to_string(),
            line_id: line_id.to_string(),
            total: total.unwrap_or(0).max(0) as u64,
        })
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn register_expected_count(&self, note_id: &str, total: u64) -> Result<()> {
        retry_on_lock("register expected count", MAX_LOCK_WAIT, || {
            self.register_once(note_id, total)
        })
        .await
    }

    async fn mark_done(&self, note_id: &str, line_id: &str) -> Result<MarkOutcome> {
        let newly_marked =
            retry_on_lock("mark unit done", MAX_LOCK_WAIT, || self.mark_once(note_id, line_id))
                .await?;

        Ok(MarkOutcome {
            newly_marked,
            status: self.read_status(note_id).await?,
        })
    }

    async fn status(&self, note_id: &str) -> Result<NoteStatus> {
        self.read_status(note_id).await
    }

    async fn evict(&self, note_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM note_progress_units WHERE note_id = ?")
            .bind(note_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM note_progress WHERE note_id = ?")
            .bind(note_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(removed > 0)
    }

    async fn evict_stale(&self, max_idle: Duration) -> Result<u64> {
        let cutoff_ms = Utc::now().timestamp_millis()
            - max_idle.as_millis().min(i64::MAX as u128) as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM note_progress_units WHERE note_id IN (
                SELECT note_id FROM note_progress WHERE touched_at_ms < ?
            )
            "#,
        )
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM note_progress WHERE touched_at_ms < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(removed)
    }

    async fn tracked_notes(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM note_progress")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
