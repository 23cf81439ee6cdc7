//! Stage completion flags
//!
//! A flag is written at most once per `(note_id, stage)`. Whoever writes it
//! owns the stage's side effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use larder_common::{Error, Result, Stage, StageStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCompletionFlag {
    pub note_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait StageFlagStore: Send + Sync {
    /// Insert the flag if absent; true only for the caller that inserted it
    async fn try_flip(&self, note_id: &str, stage: Stage, status: StageStatus) -> Result<bool>;

    async fn get(&self, note_id: &str, stage: Stage) -> Result<Option<StageCompletionFlag>>;
}

#[derive(Default)]
pub struct MemoryStageFlagStore {
    flags: Mutex<HashMap<(String, Stage), StageCompletionFlag>>,
}

impl MemoryStageFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> Error {
    Error::Internal("stage flag lock poisoned".to_string())
}

#[async_trait]
impl StageFlagStore for MemoryStageFlagStore {
    async fn try_flip(&self, note_id: &str, stage: Stage, status: StageStatus) -> Result<bool> {
        let mut flags = self.flags.lock().map_err(|_| poisoned())?;
        let key = (note_id.to_string(), stage);
        if flags.contains_key(&key) {
            return Ok(false);
        }
        flags.insert(
            key,
            StageCompletionFlag {
                note_id: note_id.to_string(),
                stage,
                status,
                completed_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn get(&self, note_id: &str, stage: Stage) -> Result<Option<StageCompletionFlag>> {
        let flags = self.flags.lock().map_err(|_| poisoned())?;
        Ok(flags.get(&(note_id.to_string(), stage)).cloned())
    }
}
