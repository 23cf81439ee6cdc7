//! # Larder Common Library
//!
//! Shared code for the recipe-note import pipeline:
//! - Error type and classification (`Error`, `Result`)
//! - Progress events (`ImportEvent`) and the `EventBus`
//! - Pipeline stages
//! - Configuration loading

pub mod config;
pub mod error;
pub mod events;
pub mod stage;

pub use error::{Error, Result};
pub use stage::{Stage, StageStatus};
