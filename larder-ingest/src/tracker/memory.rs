//! Process-local progress store
//!
//! Valid only while every unit of a note is routed to this process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use larder_common::{Error, Result};

use super::{MarkOutcome, NoteStatus, ProgressStore};

/// Progress of one note
#[derive(Debug, Clone)]
pub struct NoteProgress {
    pub note_id: String,
    pub total_units: Option<u64>,
    pub completed: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    touched_at: Instant,
}

impl NoteProgress {
    fn new(note_id: &str) -> Self {
        Self {
            note_id: note_id.to_string(),
            total_units: None,
            completed: BTreeSet::new(),
            created_at: Utc::now(),
            touched_at: Instant::now(),
        }
    }

    pub fn completed_units(&self) -> u64 {
        self.completed.len() as u64
    }

    pub fn status(&self) -> NoteStatus {
        NoteStatus::new(self.completed_units(), self.total_units)
    }
}

#[derive(Default)]
pub struct MemoryProgressStore {
    notes: Mutex<HashMap<String, NoteProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn register_expected_count(&self, note_id: &str, total: u64) -> Result<()> {
        let mut notes = self.notes.lock().await;
        let progress = notes
            .entry(note_id.to_string())
            .or_insert_with(|| NoteProgress::new(note_id));
        progress.touched_at = Instant::now();

        match progress.total_units {
            Some(registered) if registered == total => Ok(()),
            Some(registered) => Err(Error::ExpectedCountMismatch {
                note_id: note_id.to_string(),
                registered,
                requested: total,
            }),
            None if progress.completed_units() > total => Err(Error::InvalidInput(format!(
                "Note {} already has {} completed units, cannot expect {}",
                note_id,
                progress.completed_units(),
                total
            ))),
            None => {
                progress.total_units = Some(total);
                Ok(())
            }
        }
    }

    async fn mark_done(&self, note_id: &str, line_id: &str) -> Result<MarkOutcome> {
        let mut notes = self.notes.lock().await;
        let progress = notes
            .entry(note_id.to_string())
            .or_insert_with(|| NoteProgress::new(note_id));
        progress.touched_at = Instant::now();

        if progress.completed.contains(line_id) {
            return Ok(MarkOutcome {
                newly_marked: false,
                status: progress.status(),
            });
        }

        if let Some(total) = progress.total_units {
            if progress.completed_units() >= total {
                return Err(Error::UnitOverflow {
                    note_id: note_id.to_string(),
                    line_id: line_id.to_string(),
                    total,
                });
            }
        }

        progress.completed.insert(line_id.to_string());
        Ok(MarkOutcome {
            newly_marked: true,
            status: progress.status(),
        })
    }

    async fn status(&self, note_id: &str) -> Result<NoteStatus> {
        let notes = self.notes.lock().await;
        Ok(notes
            .get(note_id)
            .map(NoteProgress::status)
            .unwrap_or_else(NoteStatus::untracked))
    }

    async fn evict(&self, note_id: &str) -> Result<bool> {
        Ok(self.notes.lock().await.remove(note_id).is_some())
    }

    async fn evict_stale(&self, max_idle: Duration) -> Result<u64> {
        let mut notes = self.notes.lock().await;
        let before = notes.len();
        notes.retain(|_, progress| progress.touched_at.elapsed() <= max_idle);
        Ok((before - notes.len()) as u64)
    }

    async fn tracked_notes(&self) -> Result<u64> {
        Ok(self.notes.lock().await.len() as u64)
    }
}
