//! Progress event types for the import pipeline
//!
//! Provides the shared event definitions and the EventBus used to push
//! progress to connected UIs.

mod broadcaster;

pub use broadcaster::{NullBroadcaster, ProgressBroadcaster};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::stage::Stage;

/// Import progress events
///
/// Serialized with a `type` tag for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImportEvent {
    /// Note accepted and its units dispatched
    NoteImportStarted {
        note_id: String,
        /// Number of ingredient units dispatched
        total_units: u64,
        timestamp: DateTime<Utc>,
    },

    /// One ingredient line parsed
    LineParsed {
        note_id: Option<String>,
        line: String,
        /// Top-level rule of the parse result ("error" on failure)
        rule: String,
        segment_count: usize,
        processing_time_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// One unit persisted and counted
    UnitCompleted {
        note_id: String,
        line_id: String,
        completed_units: u64,
        total_units: u64,
        timestamp: DateTime<Utc>,
    },

    /// All units of a stage done; downstream stage scheduled
    StageCompleted {
        note_id: String,
        stage: Stage,
        /// Stage that was scheduled next, if any
        next_stage: Option<Stage>,
        timestamp: DateTime<Utc>,
    },

    /// Gate exhausted its retry budget before the stage completed
    StageFailed {
        note_id: String,
        stage: Stage,
        attempts: u32,
        completed_units: u64,
        total_units: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ImportEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &str {
        match self {
            ImportEvent::NoteImportStarted { .. } => "NoteImportStarted",
            ImportEvent::LineParsed { .. } => "LineParsed",
            ImportEvent::UnitCompleted { .. } => "UnitCompleted",
            ImportEvent::StageCompleted { .. } => "StageCompleted",
            ImportEvent::StageFailed { .. } => "StageFailed",
        }
    }

    /// Note the event belongs to, when known
    pub fn note_id(&self) -> Option<&str> {
        match self {
            ImportEvent::NoteImportStarted { note_id, .. }
            | ImportEvent::UnitCompleted { note_id, .. }
            | ImportEvent::StageCompleted { note_id, .. }
            | ImportEvent::StageFailed { note_id, .. } => Some(note_id),
            ImportEvent::LineParsed { note_id, .. } => note_id.as_deref(),
        }
    }
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged subscribers skip events instead of stalling the pipeline
///
/// # Examples
///
/// ```
/// use larder_common::events::{EventBus, ImportEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit(ImportEvent::NoteImportStarted {
///     note_id: "N1".to_string(),
///     total_units: 3,
///     timestamp: chrono::Utc::now(),
/// }).ok();
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ImportEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers drop old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ImportEvent,
    ) -> Result<usize, broadcast::error::SendError<ImportEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ImportEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ImportEvent::StageCompleted {
            note_id: "N1".to_string(),
            stage: Stage::Ingredient,
            next_stage: Some(Stage::Instruction),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StageCompleted");
        assert_eq!(json["stage"], "ingredient");
        assert_eq!(json["next_stage"], "instruction");
    }

    #[test]
    fn test_note_id_accessor() {
        let parsed = ImportEvent::LineParsed {
            note_id: None,
            line: "1 cup flour".to_string(),
            rule: "#1_ingredientLine".to_string(),
            segment_count: 3,
            processing_time_ms: 1,
            timestamp: Utc::now(),
        };
        assert_eq!(parsed.note_id(), None);

        let done = ImportEvent::UnitCompleted {
            note_id: "N1".to_string(),
            line_id: "L1".to_string(),
            completed_units: 1,
            total_units: 3,
            timestamp: Utc::now(),
        };
        assert_eq!(done.note_id(), Some("N1"));
        assert_eq!(done.event_type(), "UnitCompleted");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_error() {
        let bus = EventBus::new(10);
        let result = bus.emit(ImportEvent::NoteImportStarted {
            note_id: "N1".to_string(),
            total_units: 1,
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        for i in 0..3u64 {
            bus.emit_lossy(ImportEvent::UnitCompleted {
                note_id: "N1".to_string(),
                line_id: format!("L{}", i),
                completed_units: i + 1,
                total_units: 3,
                timestamp: Utc::now(),
            });
        }

        for i in 0..3u64 {
            match rx.recv().await.unwrap() {
                ImportEvent::UnitCompleted { completed_units, .. } => {
                    assert_eq!(completed_units, i + 1)
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
