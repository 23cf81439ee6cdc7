//! Full ingredient line grammar
//!
//! Recognizes, in order: an optional amount (integer, decimal, fraction,
//! mixed number, vulgar fraction or a range of those), an optional unit,
//! the ingredient, a trailing `, modifier` clause and parenthetical notes.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::types::{ParseOptions, SegmentKind, UnitStyle};
use super::units::canonical_unit;

/// Failure of the line grammar; converted to a terminal error result by the parser
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    #[error("empty line")]
    Empty,

    #[error("no ingredient found in {0:?}")]
    MissingIngredient(String),

    #[error("unbalanced parentheses in {0:?}")]
    UnbalancedParentheses(String),
}

/// Pluggable full parser
pub trait LineGrammar: Send + Sync {
    /// Ordered (kind, value) segments for one line
    fn parse(
        &self,
        line: &str,
        options: &ParseOptions,
    ) -> Result<Vec<(SegmentKind, String)>, GrammarError>;
}

const NUMBER: &str = r"(?:\d+\s+\d+/\d+|\d+\s*[½⅓⅔¼¾⅛⅜⅝⅞]|\d+/\d+|\d+(?:\.\d+)?|[½⅓⅔¼¾⅛⅜⅝⅞])";

static AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"^(?P<amount>{n}(?:\s*(?:-|–|to)\s*{n})?)",
        n = NUMBER
    ))
    .expect("amount pattern is valid")
});

static PARENTHETICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([^()]*)\)").expect("parenthetical pattern is valid"));

/// Default grammar for English ingredient lines
#[derive(Debug, Clone, Copy, Default)]
pub struct IngredientGrammar;

impl IngredientGrammar {
    pub fn new() -> Self {
        Self
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl LineGrammar for IngredientGrammar {
    fn parse(
        &self,
        line: &str,
        options: &ParseOptions,
    ) -> Result<Vec<(SegmentKind, String)>, GrammarError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(GrammarError::Empty);
        }

        let notes: Vec<String> = PARENTHETICAL
            .captures_iter(line)
            .filter_map(|c| c.get(1))
            .map(|m| collapse_whitespace(m.as_str()))
            .filter(|n| !n.is_empty())
            .collect();
        let without_notes = PARENTHETICAL.replace_all(line, " ");
        if without_notes.contains('(') || without_notes.contains(')') {
            return Err(GrammarError::UnbalancedParentheses(line.to_string()));
        }

        let (head, modifier) = match without_notes.split_once(',') {
            Some((head, modifier)) => (head.to_string(), Some(collapse_whitespace(modifier))),
            None => (without_notes.to_string(), None),
        };
        let head = collapse_whitespace(&head);

        let mut parts = Vec::new();
        let mut rest = head.as_str();

        if let Some(caps) = AMOUNT.captures(rest) {
            if let Some(m) = caps.name("amount") {
                parts.push((SegmentKind::Amount, m.as_str().trim().to_string()));
                rest = rest[m.end()..].trim_start();
            }
        }

        let words: Vec<&str> = rest.split(' ').filter(|w| !w.is_empty()).collect();
        let unit_match = (words.len() >= 2)
            .then(|| format!("{} {}", words[0], words[1]))
            .and_then(|two| canonical_unit(&two).map(|c| (two, c, 2)))
            .or_else(|| {
                words
                    .first()
                    .and_then(|w| canonical_unit(w).map(|c| (w.to_string(), c, 1)))
            });

        let mut ingredient_words = &words[..];
        if let Some((written, canonical, consumed)) = unit_match {
            if words.len() == consumed {
                return Err(GrammarError::MissingIngredient(line.to_string()));
            }
            let value = match options.unit_style {
                UnitStyle::Verbatim => written.trim_end_matches('.').to_string(),
                UnitStyle::Canonical => canonical.to_string(),
            };
            parts.push((SegmentKind::Unit, value));
            ingredient_words = &words[consumed..];
        }

        if ingredient_words.first() == Some(&"of") {
            ingredient_words = &ingredient_words[1..];
        }
        let ingredient = ingredient_words.join(" ");
        if !ingredient.chars().any(char::is_alphabetic) {
            return Err(GrammarError::MissingIngredient(line.to_string()));
        }
        parts.push((SegmentKind::Ingredient, ingredient));

        if options.include_modifiers {
            if let Some(modifier) = modifier.filter(|m| !m.is_empty()) {
                parts.push((SegmentKind::Modifier, modifier));
            }
            parts.extend(notes.into_iter().map(|n| (SegmentKind::Note, n)));
        }

        Ok(parts)
    }
}
