//! Fan-in completion tracking
//!
//! Counts how many of a note's expected units have finished. State lives in
//! a [`ProgressStore`] passed in by handle: [`MemoryProgressStore`] assumes
//! every unit of a note lands on this process, [`SqliteProgressStore`] is
//! shared between processes.
//!
//! Registration and marking commute: a mark may arrive before the expected
//! count is known and is counted once it is.

mod memory;
mod sqlite;

pub use memory::{MemoryProgressStore, NoteProgress};
pub use sqlite::SqliteProgressStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use larder_common::events::{ImportEvent, ProgressBroadcaster};
use larder_common::Result;

/// Snapshot of a note's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteStatus {
    pub completed_units: u64,
    /// None until the expected count is registered
    pub total_units: Option<u64>,
    pub is_complete: bool,
}

impl NoteStatus {
    pub fn new(completed_units: u64, total_units: Option<u64>) -> Self {
        let is_complete = matches!(total_units, Some(total) if total > 0 && completed_units == total);
        Self {
            completed_units,
            total_units,
            is_complete,
        }
    }

    /// Status of a note nothing is known about
    pub fn untracked() -> Self {
        Self::new(0, None)
    }
}

/// Result of marking a unit done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutcome {
    /// False when the line had already been marked
    pub newly_marked: bool,
    pub status: NoteStatus,
}

/// Keyed per-note progress state
///
/// Implementations must make `register_expected_count` and `mark_done`
/// atomic per note: `completed_units` never decreases and never exceeds a
/// registered total.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Fix the expected unit count
    ///
    /// Re-registering the same total is a no-op. A different total fails
    /// with `ExpectedCountMismatch`; a total below the units already
    /// completed fails with `InvalidInput`.
    async fn register_expected_count(&self, note_id: &str, total: u64) -> Result<()>;

    /// Record a finished line; duplicates are no-ops
    ///
    /// A new line arriving after all registered units are done fails with
    /// `UnitOverflow`.
    async fn mark_done(&self, note_id: &str, line_id: &str) -> Result<MarkOutcome>;

    /// Pure read; an unknown note reports zero of unknown
    async fn status(&self, note_id: &str) -> Result<NoteStatus>;

    /// Drop a note's progress; returns whether it was tracked
    async fn evict(&self, note_id: &str) -> Result<bool>;

    /// Drop notes untouched for longer than `max_idle`
    async fn evict_stale(&self, max_idle: Duration) -> Result<u64>;

    /// Number of notes currently tracked
    async fn tracked_notes(&self) -> Result<u64>;
}

/// Completion tracker over a progress store
pub struct CompletionTracker {
    store: Arc<dyn ProgressStore>,
    broadcaster: Arc<dyn ProgressBroadcaster>,
}

impl CompletionTracker {
    pub fn new(store: Arc<dyn ProgressStore>, broadcaster: Arc<dyn ProgressBroadcaster>) -> Self {
        Self { store, broadcaster }
    }

    pub async fn register_expected_count(&self, note_id: &str, total: u64) -> Result<()> {
        if total == 0 {
            return Err(larder_common::Error::InvalidInput(format!(
                "Expected unit count for note {} must be positive",
                note_id
            )));
        }
        self.store.register_expected_count(note_id, total).await?;
        debug!(note_id, total, "Registered expected unit count");
        Ok(())
    }

    pub async fn mark_done(&self, note_id: &str, line_id: &str) -> Result<MarkOutcome> {
        let outcome = self.store.mark_done(note_id, line_id).await?;

        if outcome.newly_marked {
            debug!(
                note_id,
                line_id,
                completed = outcome.status.completed_units,
                total = ?outcome.status.total_units,
                "Unit marked done"
            );
            self.broadcaster.publish(ImportEvent::UnitCompleted {
                note_id: note_id.to_string(),
                line_id: line_id.to_string(),
                completed_units: outcome.status.completed_units,
                total_units: outcome.status.total_units.unwrap_or(0),
                timestamp: Utc::now(),
            });
        } else {
            debug!(note_id, line_id, "Unit already marked done");
        }

        Ok(outcome)
    }

    pub async fn get_status(&self, note_id: &str) -> Result<NoteStatus> {
        self.store.status(note_id).await
    }

    pub async fn evict(&self, note_id: &str) -> Result<bool> {
        self.store.evict(note_id).await
    }

    pub async fn evict_stale(&self, max_idle: Duration) -> Result<u64> {
        self.store.evict_stale(max_idle).await
    }

    pub async fn tracked_notes(&self) -> Result<u64> {
        self.store.tracked_notes().await
    }

    /// Periodically evict abandoned notes until `shutdown` is cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Progress sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match tracker.evict_stale(max_idle).await {
                            Ok(0) => {}
                            Ok(evicted) => info!(evicted, "Evicted abandoned note progress"),
                            Err(e) => warn!(error = %e, "Progress sweep failed"),
                        }
                    }
                }
            }
        })
    }
}
