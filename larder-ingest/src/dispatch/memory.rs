//! Dispatcher that keeps jobs in memory for inspection

use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

use larder_common::{Error, Result};

use super::{Dispatcher, EnqueueOptions, Job};

/// Records every enqueued job without running it
#[derive(Default)]
pub struct MemoryDispatcher {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs queued on `queue`, oldest first
    pub fn jobs(&self, queue: &str) -> Vec<Job> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().filter(|j| j.queue == queue).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let job = Job::new(queue, payload, options);
        let id = job.id;
        self.jobs
            .lock()
            .map_err(|_| Error::Dispatch("job list lock poisoned".to_string()))?
            .push(job);
        Ok(id)
    }
}
