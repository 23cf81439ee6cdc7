//! Stage flags on the `stage_flags` primary key

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use larder_common::{Error, Result, Stage, StageStatus};

use super::flags::{StageCompletionFlag, StageFlagStore};
use crate::utils::retry_on_lock;

const MAX_LOCK_WAIT: Duration = Duration::from_secs(5);

pub struct SqliteStageFlagStore {
    pool: SqlitePool,
}

impl SqliteStageFlagStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageFlagStore for SqliteStageFlagStore {
    async fn try_flip(&self, note_id: &str, stage: Stage, status: StageStatus) -> Result<bool> {
        let inserted = retry_on_lock("flip stage flag", MAX_LOCK_WAIT, || async {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO stage_flags (note_id, stage, status, completed_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(note_id)
            .bind(stage.as_str())
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        Ok(inserted == 1)
    }

    async fn get(&self, note_id: &str, stage: Stage) -> Result<Option<StageCompletionFlag>> {
        let row = sqlx::query(
            "SELECT status, completed_at FROM stage_flags WHERE note_id = ? AND stage = ?",
        )
        .bind(note_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let completed_at: String = row.get("completed_at");
        let completed_at = DateTime::parse_from_rfc3339(&completed_at)
            .map_err(|e| Error::Internal(format!("Failed to parse completed_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(StageCompletionFlag {
            note_id: note_id.to_string(),
            stage,
            status: status.parse()?,
            completed_at,
        }))
    }
}
