//! Shared helpers

pub mod retry;

pub use retry::{is_lock_error, retry_on_lock};
