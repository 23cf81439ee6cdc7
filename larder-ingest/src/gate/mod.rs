//! Completion gate
//!
//! Decides, exactly once per note, that a stage is finished and schedules
//! the next one. The decision is the atomic insert of a stage flag; only the
//! caller whose insert succeeds may enqueue downstream work.
//!
//! States of one gate run:
//! PENDING → CHECKING → { COMPLETE, RETRY_EXHAUSTED }

mod flags;
mod sqlite;

pub use flags::{MemoryStageFlagStore, StageCompletionFlag, StageFlagStore};
pub use sqlite::SqliteStageFlagStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use larder_common::config::GateConfig;
use larder_common::events::{ImportEvent, ProgressBroadcaster};
use larder_common::{Error, Result, Stage, StageStatus};

use crate::dispatch::{Backoff, Dispatcher, EnqueueOptions};
use crate::tracker::{CompletionTracker, NoteStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Pending,
    Checking,
    Complete,
    RetryExhausted,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Complete | GateState::RetryExhausted)
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// This call flipped the flag and scheduled downstream work
    Triggered,
    /// The stage was already flagged, by this or an earlier run
    AlreadyResolved(StageStatus),
    NotYetComplete(NoteStatus),
}

/// Record of one retried gate run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRun {
    pub note_id: String,
    pub stage: Stage,
    pub state: GateState,
    pub attempts: u32,
    /// True when this run performed the downstream trigger
    pub triggered: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GateRun {
    fn new(note_id: &str, stage: Stage) -> Self {
        Self {
            note_id: note_id.to_string(),
            stage,
            state: GateState::Pending,
            attempts: 0,
            triggered: false,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn transition_to(&mut self, new_state: GateState) {
        debug!(
            note_id = %self.note_id,
            from = ?self.state,
            to = ?new_state,
            attempt = self.attempts,
            "Gate state transition"
        );
        self.state = new_state;
        if new_state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }
}

/// Gate policy
#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Stage this gate closes
    pub stage: Stage,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub downstream_queue: String,
    pub downstream_options: EnqueueOptions,
}

impl From<&GateConfig> for GateSettings {
    fn from(config: &GateConfig) -> Self {
        Self {
            stage: Stage::Ingredient,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            downstream_queue: config.downstream_queue.clone(),
            downstream_options: EnqueueOptions::new(
                config.downstream_attempts,
                Backoff::Exponential {
                    delay_ms: config.downstream_backoff_ms,
                },
            ),
        }
    }
}

/// Payload of the downstream stage job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageHandoff {
    pub note_id: String,
    /// Stage to run next
    pub stage: Stage,
    /// Stage whose completion scheduled this job
    pub triggered_by: Stage,
}

pub struct CompletionGate {
    tracker: Arc<CompletionTracker>,
    flags: Arc<dyn StageFlagStore>,
    dispatcher: Arc<dyn Dispatcher>,
    broadcaster: Arc<dyn ProgressBroadcaster>,
    settings: GateSettings,
}

impl CompletionGate {
    pub fn new(
        tracker: Arc<CompletionTracker>,
        flags: Arc<dyn StageFlagStore>,
        dispatcher: Arc<dyn Dispatcher>,
        broadcaster: Arc<dyn ProgressBroadcaster>,
        settings: GateSettings,
    ) -> Self {
        Self {
            tracker,
            flags,
            dispatcher,
            broadcaster,
            settings,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Current flag for a note, if the stage is resolved
    pub async fn flag(&self, note_id: &str) -> Result<Option<StageCompletionFlag>> {
        self.flags.get(note_id, self.settings.stage).await
    }

    /// Single idempotent check; safe to call after every unit save
    pub async fn check_and_trigger(&self, note_id: &str) -> Result<GateOutcome> {
        if let Some(flag) = self.flag(note_id).await? {
            return Ok(GateOutcome::AlreadyResolved(flag.status));
        }

        let status = self.tracker.get_status(note_id).await?;
        if !status.is_complete {
            return Ok(GateOutcome::NotYetComplete(status));
        }

        self.trigger(note_id).await
    }

    /// Resolve a stage that has no units to wait for
    pub async fn complete_stage(&self, note_id: &str) -> Result<GateOutcome> {
        self.trigger(note_id).await
    }

    async fn trigger(&self, note_id: &str) -> Result<GateOutcome> {
        let stage = self.settings.stage;

        if !self
            .flags
            .try_flip(note_id, stage, StageStatus::Completed)
            .await?
        {
            debug!(note_id, %stage, "Stage already flagged by another caller");
            let status = self
                .flag(note_id)
                .await?
                .map(|f| f.status)
                .unwrap_or(StageStatus::Completed);
            return Ok(GateOutcome::AlreadyResolved(status));
        }

        let next_stage = stage.next();
        if let Some(next) = next_stage {
            let payload = serde_json::to_value(StageHandoff {
                note_id: note_id.to_string(),
                stage: next,
                triggered_by: stage,
            })?;

            if let Err(e) = self
                .dispatcher
                .enqueue(
                    &self.settings.downstream_queue,
                    payload,
                    self.settings.downstream_options,
                )
                .await
            {
                error!(
                    note_id,
                    %stage,
                    next_stage = %next,
                    queue = %self.settings.downstream_queue,
                    error = %e,
                    "Stage flagged complete but downstream job was not scheduled"
                );
                return Err(Error::OrphanedStage {
                    note_id: note_id.to_string(),
                    stage,
                    reason: e.to_string(),
                });
            }
        }

        info!(note_id, %stage, next_stage = ?next_stage, "Stage complete, downstream scheduled");
        self.broadcaster.publish(ImportEvent::StageCompleted {
            note_id: note_id.to_string(),
            stage,
            next_stage,
            timestamp: Utc::now(),
        });
        self.evict(note_id).await;

        Ok(GateOutcome::Triggered)
    }

    /// Retried gate: up to `max_attempts` checks, then the stage is failed
    pub async fn run(&self, note_id: &str) -> Result<GateRun> {
        let mut run = GateRun::new(note_id, self.settings.stage);
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            run.attempts = attempt;
            run.transition_to(GateState::Checking);

            match self.check_and_trigger(note_id).await {
                Ok(GateOutcome::Triggered) => {
                    run.triggered = true;
                    run.transition_to(GateState::Complete);
                    return Ok(run);
                }
                Ok(GateOutcome::AlreadyResolved(status)) => {
                    run.transition_to(resolved_state(status));
                    return Ok(run);
                }
                Ok(GateOutcome::NotYetComplete(status)) => {
                    debug!(
                        note_id,
                        attempt,
                        completed = status.completed_units,
                        total = ?status.total_units,
                        "Stage not complete yet"
                    );
                }
                Err(e @ Error::OrphanedStage { .. }) => return Err(e),
                Err(e) => {
                    warn!(note_id, attempt, error = %e, "Gate check failed");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        self.fail_stage(run).await
    }

    async fn fail_stage(&self, mut run: GateRun) -> Result<GateRun> {
        let note_id = run.note_id.clone();
        let stage = self.settings.stage;

        if !self
            .flags
            .try_flip(&note_id, stage, StageStatus::Failed)
            .await?
        {
            let status = self
                .flag(&note_id)
                .await?
                .map(|f| f.status)
                .unwrap_or(StageStatus::Failed);
            run.transition_to(resolved_state(status));
            return Ok(run);
        }

        let status = match self.tracker.get_status(&note_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(note_id = %note_id, error = %e, "Progress unavailable for failed stage");
                NoteStatus::untracked()
            }
        };

        error!(
            note_id = %note_id,
            %stage,
            attempts = run.attempts,
            completed = status.completed_units,
            total = ?status.total_units,
            "Stage failed: gate retry budget exhausted"
        );
        self.broadcaster.publish(ImportEvent::StageFailed {
            note_id: note_id.clone(),
            stage,
            attempts: run.attempts,
            completed_units: status.completed_units,
            total_units: status.total_units.unwrap_or(0),
            timestamp: Utc::now(),
        });
        self.evict(&note_id).await;

        run.transition_to(GateState::RetryExhausted);
        Ok(run)
    }

    async fn evict(&self, note_id: &str) {
        if let Err(e) = self.tracker.evict(note_id).await {
            warn!(note_id, error = %e, "Failed to evict note progress");
        }
    }
}

fn resolved_state(status: StageStatus) -> GateState {
    match status {
        StageStatus::Completed => GateState::Complete,
        StageStatus::Failed => GateState::RetryExhausted,
    }
}
