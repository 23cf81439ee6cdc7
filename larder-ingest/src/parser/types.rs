//! Parse result shapes shared by every parser

use serde::{Deserialize, Serialize};

/// Rule name of a successful full-grammar parse
pub const GRAMMAR_RULE: &str = "#1_ingredientLine";
/// Rule name of an adapted heuristic parse
pub const HEURISTIC_RULE: &str = "#2_heuristic";
/// Rule and type of a failed parse
pub const ERROR_RULE: &str = "error";

/// Kind of a parsed segment, in positional order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Amount,
    Unit,
    Ingredient,
    Modifier,
    Note,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Amount => "amount",
            SegmentKind::Unit => "unit",
            SegmentKind::Ingredient => "ingredient",
            SegmentKind::Modifier => "modifier",
            SegmentKind::Note => "note",
        }
    }

    /// Segment rule name
    pub fn rule(&self) -> &'static str {
        match self {
            SegmentKind::Amount => "#1_amount",
            SegmentKind::Unit => "#2_unit",
            SegmentKind::Ingredient => "#3_ingredient",
            SegmentKind::Modifier => "#4_modifier",
            SegmentKind::Note => "#5_note",
        }
    }
}

/// One positional piece of a parsed line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub index: usize,
    pub rule: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub processing_time_ms: u64,
}

/// Normalized parse of one ingredient line; immutable once returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseResult {
    pub rule: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub segments: Vec<Segment>,
    pub processing_time_ms: u64,
}

impl ParseResult {
    /// Build a result from ordered (kind, value) pairs
    pub fn from_parts(
        rule: &str,
        parts: Vec<(SegmentKind, String)>,
        processing_time_ms: u64,
    ) -> Self {
        let segments = parts
            .into_iter()
            .enumerate()
            .map(|(index, (kind, value))| Segment {
                index,
                rule: kind.rule().to_string(),
                kind: kind.as_str().to_string(),
                value,
                processing_time_ms,
            })
            .collect();

        Self {
            rule: rule.to_string(),
            kind: "ingredientLine".to_string(),
            segments,
            processing_time_ms,
        }
    }

    /// Terminal result for a line that could not be parsed
    pub fn error(processing_time_ms: u64) -> Self {
        Self {
            rule: ERROR_RULE.to_string(),
            kind: ERROR_RULE.to_string(),
            segments: Vec::new(),
            processing_time_ms,
        }
    }

    pub fn is_error(&self) -> bool {
        self.rule == ERROR_RULE
    }

    /// First segment value of the given kind
    pub fn value_of(&self, kind: SegmentKind) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.kind == kind.as_str())
            .map(|s| s.value.as_str())
    }
}

/// Unit naming in parse output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitStyle {
    /// Unit text as written ("Tbsp")
    #[default]
    Verbatim,
    /// Canonical unit name ("tablespoon")
    Canonical,
}

/// Parsing options; every field participates in the cache key fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParseOptions {
    /// Memoize through the result cache
    pub cache_results: bool,
    /// Minimum heuristic confidence accepted without the full grammar
    pub confidence_threshold: f32,
    /// Emit modifier and parenthetical note segments
    pub include_modifiers: bool,
    pub unit_style: UnitStyle,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            cache_results: true,
            confidence_threshold: 0.8,
            include_modifiers: true,
            unit_style: UnitStyle::Verbatim,
        }
    }
}

impl ParseOptions {
    pub fn uncached() -> Self {
        Self {
            cache_results: false,
            ..Self::default()
        }
    }
}
