//! Note processing stages
//!
//! A stage completes once every unit dispatched for it is done. Stage
//! completion is recorded at most once per (note, stage).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Named phase of note processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Ingredient lines parsed and saved
    Ingredient,
    /// Instruction lines parsed and saved
    Instruction,
    /// Images converted and stored
    Image,
    /// Note fully processed
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingredient => "ingredient",
            Stage::Instruction => "instruction",
            Stage::Image => "image",
            Stage::Finalize => "finalize",
        }
    }

    /// Stage scheduled once this one completes
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Ingredient => Some(Stage::Instruction),
            Stage::Instruction => Some(Stage::Image),
            Stage::Image => Some(Stage::Finalize),
            Stage::Finalize => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingredient" => Ok(Stage::Ingredient),
            "instruction" => Ok(Stage::Instruction),
            "image" => Ok(Stage::Image),
            "finalize" => Ok(Stage::Finalize),
            other => Err(Error::InvalidInput(format!("Unknown stage: {}", other))),
        }
    }
}

/// Terminal outcome recorded for a (note, stage) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// All units done, downstream stage scheduled by the winning gate
    Completed,
    /// Gate retry budget exhausted before all units were done
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl FromStr for StageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown stage status: {}", other))),
        }
    }
}
