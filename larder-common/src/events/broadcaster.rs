//! Fire-and-forget progress publishing
//!
//! Publishing never fails the caller: a broadcaster swallows and logs its
//! own delivery problems.

use tracing::debug;

use super::{EventBus, ImportEvent};

/// Sink for progress events
pub trait ProgressBroadcaster: Send + Sync {
    fn publish(&self, event: ImportEvent);
}

impl ProgressBroadcaster for EventBus {
    fn publish(&self, event: ImportEvent) {
        let event_type = event.event_type().to_string();
        match self.emit(event) {
            Ok(receiver_count) => {
                debug!(event_type = %event_type, receiver_count, "Progress event broadcast");
            }
            Err(_) => {
                debug!(event_type = %event_type, "No receivers for progress event");
            }
        }
    }
}

/// Broadcaster that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl ProgressBroadcaster for NullBroadcaster {
    fn publish(&self, _event: ImportEvent) {}
}
