//! Persistence of parsed ingredient lines

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use larder_common::{Error, Result};

use crate::parser::ParseResult;
use crate::utils::retry_on_lock;

/// How long a save keeps retrying on lock contention
const MAX_LOCK_WAIT: Duration = Duration::from_secs(5);

/// One parsed line ready to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedUnit {
    pub note_id: String,
    pub line_id: String,
    pub line: String,
    pub result: ParseResult,
}

/// Identity of a persisted unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedUnit {
    pub id: Uuid,
}

/// Store for final parse results
///
/// Saves must be idempotent per `(note_id, line_id)` since units are
/// redelivered after failures.
#[async_trait]
pub trait ParsedUnitStore: Send + Sync {
    async fn save_parsed_unit(&self, unit: &ParsedUnit) -> Result<SavedUnit>;
}

pub struct SqliteUnitStore {
    pool: SqlitePool,
}

impl SqliteUnitStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Saved units of a note ordered by line id
    pub async fn list_for_note(&self, note_id: &str) -> Result<Vec<ParsedUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT note_id, line_id, raw_line, parse_result
            FROM parsed_ingredient_lines
            WHERE note_id = ?
            ORDER BY CAST(substr(line_id, 2) AS INTEGER), line_id
            "#,
        )
        .bind(note_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let result: String = row.get("parse_result");
                Ok(ParsedUnit {
                    note_id: row.get("note_id"),
                    line_id: row.get("line_id"),
                    line: row.get("raw_line"),
                    result: serde_json::from_str(&result)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ParsedUnitStore for SqliteUnitStore {
    async fn save_parsed_unit(&self, unit: &ParsedUnit) -> Result<SavedUnit> {
        let parse_result = serde_json::to_string(&unit.result)?;

        let id: String = retry_on_lock("save parsed unit", MAX_LOCK_WAIT, || async {
            let id = sqlx::query_scalar::<_, String>(
                r#"
                INSERT INTO parsed_ingredient_lines (
                    id, note_id, line_id, raw_line, rule, parse_result, saved_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(note_id, line_id) DO UPDATE SET
                    raw_line = excluded.raw_line,
                    rule = excluded.rule,
                    parse_result = excluded.parse_result,
                    saved_at = excluded.saved_at
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&unit.note_id)
            .bind(&unit.line_id)
            .bind(&unit.line)
            .bind(&unit.result.rule)
            .bind(&parse_result)
            .bind(Utc::now().to_rfc3339())
            .fetch_one(&self.pool)
            .await?;
            Ok::<_, Error>(id)
        })
        .await?;

        let id = Uuid::parse_str(&id)
            .map_err(|e| Error::Internal(format!("Stored unit id is not a UUID: {}", e)))?;

        tracing::debug!(
            note_id = %unit.note_id,
            line_id = %unit.line_id,
            unit_id = %id,
            "Saved parsed unit"
        );

        Ok(SavedUnit { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::parser::{ParseResult, SegmentKind, GRAMMAR_RULE};

    fn unit(line_id: &str, line: &str) -> ParsedUnit {
        ParsedUnit {
            note_id: "N1".to_string(),
            line_id: line_id.to_string(),
            line: line.to_string(),
            result: ParseResult::from_parts(
                GRAMMAR_RULE,
                vec![(SegmentKind::Ingredient, line.to_string())],
                1,
            ),
        }
    }

    #[tokio::test]
    async fn test_save_and_list() {
        let store = SqliteUnitStore::new(test_pool().await);

        store.save_parsed_unit(&unit("L2", "salt")).await.unwrap();
        store.save_parsed_unit(&unit("L1", "flour")).await.unwrap();

        let units = store.list_for_note("N1").await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].line_id, "L1");
        assert_eq!(units[0].result.value_of(SegmentKind::Ingredient), Some("flour"));
        assert!(store.list_for_note("N2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_follows_line_position() {
        let store = SqliteUnitStore::new(test_pool().await);
        for n in [10, 2, 1, 11] {
            let line_id = format!("L{}", n);
            store.save_parsed_unit(&unit(&line_id, "salt")).await.unwrap();
        }

        let ids: Vec<String> = store
            .list_for_note("N1")
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.line_id)
            .collect();
        assert_eq!(ids, vec!["L1", "L2", "L10", "L11"]);
    }

    #[tokio::test]
    async fn test_redelivered_save_keeps_id_and_updates_result() {
        let store = SqliteUnitStore::new(test_pool().await);

        let first = store.save_parsed_unit(&unit("L1", "flour")).await.unwrap();
        let second = store.save_parsed_unit(&unit("L1", "bread flour")).await.unwrap();

        assert_eq!(first, second);
        let units = store.list_for_note("N1").await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].line, "bread flour");
    }
}
