//! Job dispatch
//!
//! Units of work and the downstream handoff travel as JSON jobs on named
//! queues. Delivery is at-least-once: a failed job is redelivered until its
//! attempt budget is spent, so every handler must be idempotent.

mod memory;
mod pool;

pub use memory::MemoryDispatcher;
pub use pool::{PoolStats, WorkerPool};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use larder_common::Result;

/// Delay before redelivering a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    /// Doubles after each failure
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay after the given number of failed attempts (1-based)
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exponent = failed_attempts.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Delivery policy for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Total deliveries allowed, including the first
    pub attempts: u32,
    pub backoff: Backoff,
}

impl EnqueueOptions {
    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::new(1, Backoff::Fixed { delay_ms: 0 })
    }
}

/// A queued job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Current delivery, starting at 1
    pub attempt: u32,
    pub options: EnqueueOptions,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(queue: &str, payload: serde_json::Value, options: EnqueueOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            attempt: 1,
            options,
            enqueued_at: Utc::now(),
        }
    }

    /// Decode the payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.options.attempts
    }
}

/// Job queue front end
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queue a job; returns its id
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid>;
}

/// Consumer of one queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> &str;

    /// Process one delivery. Errors trigger redelivery unless they are logic
    /// errors or the attempt budget is spent.
    async fn handle(&self, job: &Job) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let fixed = Backoff::Fixed { delay_ms: 100 };
        assert_eq!(fixed.delay_for(1), Duration::from_millis(100));
        assert_eq!(fixed.delay_for(5), Duration::from_millis(100));

        let exp = Backoff::Exponential { delay_ms: 100 };
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_attempts_are_at_least_one() {
        let options = EnqueueOptions::new(0, Backoff::Fixed { delay_ms: 0 });
        assert_eq!(options.attempts, 1);

        let job = Job::new("q", serde_json::json!({}), options);
        assert!(job.is_last_attempt());
    }

    #[test]
    fn test_payload_decoding() {
        #[derive(Deserialize)]
        struct Payload {
            note_id: String,
        }

        let job = Job::new(
            "q",
            serde_json::json!({ "note_id": "N1" }),
            EnqueueOptions::default(),
        );
        assert_eq!(job.payload_as::<Payload>().unwrap().note_id, "N1");
        assert!(job.payload_as::<Vec<u8>>().is_err());
    }
}
