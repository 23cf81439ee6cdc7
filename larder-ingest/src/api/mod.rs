//! HTTP API handlers

pub mod cache;
pub mod health;
pub mod notes;
pub mod sse;

pub use cache::cache_routes;
pub use health::health_routes;
pub use notes::note_routes;
pub use sse::event_stream;
