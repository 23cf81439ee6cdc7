//! Units of work
//!
//! A note import fans out into one job per ingredient line plus one retried
//! gate job. Each line job runs parse → save → mark done → gate check; the
//! gate check after every save usually closes the stage, the gate job covers
//! the case where the last save lands after its own check.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use larder_common::events::{ImportEvent, ProgressBroadcaster};
use larder_common::{Error, Result};

use crate::db::{ParsedUnit, ParsedUnitStore};
use crate::dispatch::{Dispatcher, EnqueueOptions, Job, JobHandler};
use crate::gate::{CompletionGate, GateOutcome};
use crate::parser::{LineParser, ParseOptions};
use crate::tracker::{CompletionTracker, NoteStatus};

/// Queue of per-line jobs
pub const INGREDIENT_QUEUE: &str = "ingredient";
/// Queue of retried gate runs
pub const GATE_QUEUE: &str = "ingredient-gate";

/// Payload of a line job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitJob {
    pub note_id: String,
    pub line_id: String,
    pub line: String,
    #[serde(default)]
    pub options: ParseOptions,
}

/// Payload of a gate job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateJob {
    pub note_id: String,
}

fn decode<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T> {
    job.payload_as()
        .map_err(|e| Error::InvalidInput(format!("Malformed {} job {}: {}", job.queue, job.id, e)))
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit_id: Uuid,
    pub newly_marked: bool,
    pub status: NoteStatus,
    /// None when the gate check errored
    pub gate: Option<GateOutcome>,
}

/// Handler for line jobs
pub struct UnitProcessor {
    parser: Arc<LineParser>,
    store: Arc<dyn ParsedUnitStore>,
    tracker: Arc<CompletionTracker>,
    gate: Arc<CompletionGate>,
}

impl UnitProcessor {
    pub fn new(
        parser: Arc<LineParser>,
        store: Arc<dyn ParsedUnitStore>,
        tracker: Arc<CompletionTracker>,
        gate: Arc<CompletionGate>,
    ) -> Self {
        Self {
            parser,
            store,
            tracker,
            gate,
        }
    }

    /// Run one unit; a failed save leaves the unit unmarked for redelivery
    pub async fn process(&self, unit: &UnitJob) -> Result<UnitReport> {
        let result = self
            .parser
            .parse_for_note(Some(&unit.note_id), &unit.line, &unit.options)
            .await;

        let saved = self
            .store
            .save_parsed_unit(&ParsedUnit {
                note_id: unit.note_id.clone(),
                line_id: unit.line_id.clone(),
                line: unit.line.clone(),
                result,
            })
            .await?;

        let outcome = self.tracker.mark_done(&unit.note_id, &unit.line_id).await?;

        let gate = match self.gate.check_and_trigger(&unit.note_id).await {
            Ok(outcome) => Some(outcome),
            Err(e @ Error::OrphanedStage { .. }) => {
                error!(
                    note_id = %unit.note_id,
                    line_id = %unit.line_id,
                    error = %e,
                    "Unit closed its stage but downstream work is missing"
                );
                None
            }
            Err(e) => {
                warn!(
                    note_id = %unit.note_id,
                    line_id = %unit.line_id,
                    error = %e,
                    "Gate check after save failed, gate job will retry"
                );
                None
            }
        };

        Ok(UnitReport {
            unit_id: saved.id,
            newly_marked: outcome.newly_marked,
            status: outcome.status,
            gate,
        })
    }
}

#[async_trait]
impl JobHandler for UnitProcessor {
    fn queue(&self) -> &str {
        INGREDIENT_QUEUE
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let unit: UnitJob = decode(job)?;
        let report = self.process(&unit).await?;
        debug!(
            note_id = %unit.note_id,
            line_id = %unit.line_id,
            attempt = job.attempt,
            completed = report.status.completed_units,
            "Unit processed"
        );
        Ok(())
    }
}

/// Handler for gate jobs
pub struct GateJobHandler {
    gate: Arc<CompletionGate>,
}

impl GateJobHandler {
    pub fn new(gate: Arc<CompletionGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl JobHandler for GateJobHandler {
    fn queue(&self) -> &str {
        GATE_QUEUE
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let GateJob { note_id } = decode(job)?;
        match self.gate.run(&note_id).await {
            Ok(run) => {
                debug!(note_id = %note_id, state = ?run.state, attempts = run.attempts, "Gate run finished");
                Ok(())
            }
            // Redelivery cannot schedule the missing work; the gate has already reported it.
            Err(Error::OrphanedStage { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Acknowledgement of an accepted import
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReceipt {
    pub note_id: String,
    pub total_units: u64,
    pub gate_job_id: Option<Uuid>,
}

/// Fans a note out into unit jobs
pub struct NoteImporter {
    tracker: Arc<CompletionTracker>,
    gate: Arc<CompletionGate>,
    dispatcher: Arc<dyn Dispatcher>,
    broadcaster: Arc<dyn ProgressBroadcaster>,
    parse_options: ParseOptions,
    unit_options: EnqueueOptions,
    gate_options: EnqueueOptions,
}

impl NoteImporter {
    pub fn new(
        tracker: Arc<CompletionTracker>,
        gate: Arc<CompletionGate>,
        dispatcher: Arc<dyn Dispatcher>,
        broadcaster: Arc<dyn ProgressBroadcaster>,
        parse_options: ParseOptions,
        unit_options: EnqueueOptions,
        gate_options: EnqueueOptions,
    ) -> Self {
        Self {
            tracker,
            gate,
            dispatcher,
            broadcaster,
            parse_options,
            unit_options,
            gate_options,
        }
    }

    /// Line ids are 1-based positions in the note, so a re-import yields the same ids
    pub fn units_for(&self, note_id: &str, lines: &[String]) -> Vec<UnitJob> {
        lines
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| UnitJob {
                note_id: note_id.to_string(),
                line_id: format!("L{}", i + 1),
                line: line.trim().to_string(),
                options: self.parse_options.clone(),
            })
            .collect()
    }

    /// Register the expected count, then dispatch every unit and one gate job
    pub async fn import(&self, note_id: &str, lines: &[String]) -> Result<ImportReceipt> {
        if note_id.trim().is_empty() {
            return Err(Error::InvalidInput("note id must not be empty".to_string()));
        }

        let units = self.units_for(note_id, lines);
        let total_units = units.len() as u64;

        if units.is_empty() {
            info!(note_id, "Note has no ingredient lines, closing stage");
            self.gate.complete_stage(note_id).await?;
            return Ok(ImportReceipt {
                note_id: note_id.to_string(),
                total_units,
                gate_job_id: None,
            });
        }

        self.tracker.register_expected_count(note_id, total_units).await?;

        for unit in &units {
            self.dispatcher
                .enqueue(INGREDIENT_QUEUE, serde_json::to_value(unit)?, self.unit_options)
                .await?;
        }

        let gate_job_id = self
            .dispatcher
            .enqueue(
                GATE_QUEUE,
                serde_json::to_value(GateJob {
                    note_id: note_id.to_string(),
                })?,
                self.gate_options,
            )
            .await?;

        info!(note_id, total_units, "Note import dispatched");
        self.broadcaster.publish(ImportEvent::NoteImportStarted {
            note_id: note_id.to_string(),
            total_units,
            timestamp: Utc::now(),
        });

        Ok(ImportReceipt {
            note_id: note_id.to_string(),
            total_units,
            gate_job_id: Some(gate_job_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheOptions, MemorySharedStore, ResultCache};
    use crate::db::SavedUnit;
    use crate::dispatch::MemoryDispatcher;
    use crate::gate::{GateSettings, MemoryStageFlagStore};
    use crate::tracker::MemoryProgressStore;
    use larder_common::config::GateConfig;
    use larder_common::events::NullBroadcaster;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the first `failures` saves, records the rest
    struct FlakyStore {
        failures: Mutex<u32>,
        saved: Mutex<Vec<ParsedUnit>>,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                saved: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ParsedUnitStore for FlakyStore {
        async fn save_parsed_unit(&self, unit: &ParsedUnit) -> Result<SavedUnit> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Internal("disk full".to_string()));
            }
            self.saved.lock().unwrap().push(unit.clone());
            Ok(SavedUnit { id: Uuid::new_v4() })
        }
    }

    struct Fixture {
        tracker: Arc<CompletionTracker>,
        gate: Arc<CompletionGate>,
        dispatcher: Arc<MemoryDispatcher>,
        processor: UnitProcessor,
        store: Arc<FlakyStore>,
    }

    fn fixture(save_failures: u32) -> Fixture {
        let tracker = Arc::new(CompletionTracker::new(
            Arc::new(MemoryProgressStore::new()),
            Arc::new(NullBroadcaster),
        ));
        let dispatcher = Arc::new(MemoryDispatcher::new());
        let gate = Arc::new(CompletionGate::new(
            tracker.clone(),
            Arc::new(MemoryStageFlagStore::new()),
            dispatcher.clone(),
            Arc::new(NullBroadcaster),
            GateSettings {
                retry_delay: Duration::from_millis(1),
                ..GateSettings::from(&GateConfig::default())
            },
        ));
        let parser = Arc::new(LineParser::new(
            Arc::new(ResultCache::new(100, Arc::new(MemorySharedStore::new()))),
            CacheOptions::default(),
            Arc::new(NullBroadcaster),
        ));
        let store = Arc::new(FlakyStore::new(save_failures));
        let processor = UnitProcessor::new(parser, store.clone(), tracker.clone(), gate.clone());

        Fixture {
            tracker,
            gate,
            dispatcher,
            processor,
            store,
        }
    }

    fn importer(f: &Fixture) -> NoteImporter {
        NoteImporter::new(
            f.tracker.clone(),
            f.gate.clone(),
            f.dispatcher.clone(),
            Arc::new(NullBroadcaster),
            ParseOptions::default(),
            EnqueueOptions::default(),
            EnqueueOptions::default(),
        )
    }

    fn unit(line_id: &str, line: &str) -> UnitJob {
        UnitJob {
            note_id: "N1".to_string(),
            line_id: line_id.to_string(),
            line: line.to_string(),
            options: ParseOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_save_failure_prevents_mark_done() {
        let f = fixture(1);
        f.tracker.register_expected_count("N1", 1).await.unwrap();

        assert!(f.processor.process(&unit("L1", "1 cup flour")).await.is_err());
        assert_eq!(f.tracker.get_status("N1").await.unwrap().completed_units, 0);

        let report = f.processor.process(&unit("L1", "1 cup flour")).await.unwrap();
        assert!(report.newly_marked);
        assert_eq!(report.gate, Some(GateOutcome::Triggered));
        assert_eq!(f.dispatcher.jobs("instruction").len(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_unit_is_counted_once() {
        let f = fixture(0);
        f.tracker.register_expected_count("N1", 2).await.unwrap();

        f.processor.process(&unit("L1", "1 cup flour")).await.unwrap();
        let again = f.processor.process(&unit("L1", "1 cup flour")).await.unwrap();

        assert!(!again.newly_marked);
        assert_eq!(again.status.completed_units, 1);
        assert!(matches!(again.gate, Some(GateOutcome::NotYetComplete(_))));
        assert_eq!(f.store.saved.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_line_still_completes_unit() {
        let f = fixture(0);
        f.tracker.register_expected_count("N1", 1).await.unwrap();

        let report = f.processor.process(&unit("L1", "2 cups")).await.unwrap();

        assert!(report.status.is_complete);
        assert!(f.store.saved.lock().unwrap()[0].result.is_error());
    }

    #[tokio::test]
    async fn test_import_fans_out_units_and_gate_job() {
        let f = fixture(0);
        let lines: Vec<String> = ["1 cup flour", "", "2 eggs", "  "]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let receipt = importer(&f).import("N1", &lines).await.unwrap();

        assert_eq!(receipt.total_units, 2);
        let units: Vec<UnitJob> = f
            .dispatcher
            .jobs(INGREDIENT_QUEUE)
            .iter()
            .map(|j| j.payload_as().unwrap())
            .collect();
        let ids: Vec<&str> = units.iter().map(|u| u.line_id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "L3"]);
        assert_eq!(f.dispatcher.jobs(GATE_QUEUE).len(), 1);
        assert_eq!(
            f.tracker.get_status("N1").await.unwrap().total_units,
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_reimport_with_different_line_count_is_rejected() {
        let f = fixture(0);
        let importer = importer(&f);
        importer
            .import("N1", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let err = importer.import("N1", &["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::ExpectedCountMismatch { .. }));
    }

    #[tokio::test]
    async fn test_empty_note_closes_stage_immediately() {
        let f = fixture(0);

        let receipt = importer(&f).import("N1", &[]).await.unwrap();

        assert_eq!(receipt.total_units, 0);
        assert!(receipt.gate_job_id.is_none());
        assert_eq!(f.dispatcher.jobs("instruction").len(), 1);
    }
}
