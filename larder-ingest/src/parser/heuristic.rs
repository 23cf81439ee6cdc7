//! Fast token heuristic tried before the full grammar

use serde::{Deserialize, Serialize};

use super::types::{ParseOptions, SegmentKind, UnitStyle};
use super::units::{canonical_unit, FRACTION_CHARS};

/// Outcome of the quick parse; cached verbatim under the `parse` operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeuristicParse {
    /// 0.0 to 1.0
    pub confidence: f32,
    pub amount: Option<String>,
    pub unit: Option<String>,
    pub canonical_unit: Option<String>,
    pub ingredient: Option<String>,
    pub modifier: Option<String>,
}

impl HeuristicParse {
    /// Ordered segments honoring the output options
    pub fn to_parts(&self, options: &ParseOptions) -> Vec<(SegmentKind, String)> {
        let mut parts = Vec::new();
        if let Some(amount) = &self.amount {
            parts.push((SegmentKind::Amount, amount.clone()));
        }
        let unit = match options.unit_style {
            UnitStyle::Verbatim => self.unit.as_ref(),
            UnitStyle::Canonical => self.canonical_unit.as_ref(),
        };
        if let Some(unit) = unit {
            parts.push((SegmentKind::Unit, unit.clone()));
        }
        if let Some(ingredient) = &self.ingredient {
            parts.push((SegmentKind::Ingredient, ingredient.clone()));
        }
        if options.include_modifiers {
            if let Some(modifier) = &self.modifier {
                parts.push((SegmentKind::Modifier, modifier.clone()));
            }
        }
        parts
    }
}

/// Pluggable quick parser
pub trait HeuristicParser: Send + Sync {
    fn parse(&self, line: &str) -> HeuristicParse;
}

/// Whitespace token heuristic
///
/// Scores start at 0.2 and gain 0.3 for a leading amount, 0.3 for a known
/// unit and 0.2 for an alphabetic ingredient. Parentheses cost 0.4 since
/// the heuristic does not understand notes; long ingredient phrases cost 0.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenHeuristic;

fn is_amount_token(token: &str) -> bool {
    let has_digit = token
        .chars()
        .any(|c| c.is_ascii_digit() || FRACTION_CHARS.contains(&c));
    has_digit
        && token.chars().all(|c| {
            c.is_ascii_digit() || FRACTION_CHARS.contains(&c) || matches!(c, '/' | '.' | '-')
        })
}

impl HeuristicParser for TokenHeuristic {
    fn parse(&self, line: &str) -> HeuristicParse {
        let (head, modifier) = match line.split_once(',') {
            Some((head, modifier)) => {
                let modifier = modifier.split_whitespace().collect::<Vec<_>>().join(" ");
                (head, (!modifier.is_empty()).then_some(modifier))
            }
            None => (line, None),
        };
        let tokens: Vec<&str> = head.split_whitespace().collect();
        let mut pos = 0;

        let mut amount = None;
        if tokens.first().is_some_and(|t| is_amount_token(t)) {
            let mut value = tokens[0].to_string();
            pos = 1;
            if tokens.get(1).is_some_and(|t| t.contains('/') && is_amount_token(t)) {
                value = format!("{} {}", value, tokens[1]);
                pos = 2;
            }
            amount = Some(value);
        }

        let mut unit = None;
        let mut canonical = None;
        if let Some(token) = tokens.get(pos) {
            if let Some(c) = canonical_unit(token) {
                unit = Some(token.trim_end_matches('.').to_string());
                canonical = Some(c.to_string());
                pos += 1;
            }
        }

        let mut rest = &tokens[pos.min(tokens.len())..];
        if rest.first() == Some(&"of") {
            rest = &rest[1..];
        }
        let ingredient = (!rest.is_empty()).then(|| rest.join(" "));
        let alphabetic = ingredient
            .as_deref()
            .is_some_and(|i| i.chars().any(char::is_alphabetic));

        let confidence = if !alphabetic {
            0.0
        } else {
            let mut score: f32 = 0.2 + 0.2;
            if amount.is_some() {
                score += 0.3;
            }
            if unit.is_some() {
                score += 0.3;
            }
            if line.contains('(') || line.contains(')') {
                score -= 0.4;
            }
            if rest.len() > 4 {
                score -= 0.1;
            }
            score.clamp(0.0, 1.0)
        };

        HeuristicParse {
            confidence,
            amount,
            unit,
            canonical_unit: canonical,
            ingredient,
            modifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_line_is_confident() {
        let parse = TokenHeuristic.parse("1 cup flour");
        assert!(parse.confidence >= 0.99);
        assert_eq!(parse.amount.as_deref(), Some("1"));
        assert_eq!(parse.unit.as_deref(), Some("cup"));
        assert_eq!(parse.ingredient.as_deref(), Some("flour"));
    }

    #[test]
    fn test_mixed_number_and_modifier() {
        let parse = TokenHeuristic.parse("1 1/2 Tbsp. butter, melted");
        assert_eq!(parse.amount.as_deref(), Some("1 1/2"));
        assert_eq!(parse.unit.as_deref(), Some("Tbsp"));
        assert_eq!(parse.canonical_unit.as_deref(), Some("tablespoon"));
        assert_eq!(parse.modifier.as_deref(), Some("melted"));
    }

    #[test]
    fn test_unitless_and_parenthetical_lines_score_low() {
        assert!(TokenHeuristic.parse("3 eggs").confidence < 0.8);
        assert!(TokenHeuristic.parse("2 (14 oz) cans tomatoes").confidence < 0.8);
    }

    #[test]
    fn test_no_ingredient_scores_zero() {
        assert_eq!(TokenHeuristic.parse("2 cups").confidence, 0.0);
        assert_eq!(TokenHeuristic.parse("").confidence, 0.0);
    }

    #[test]
    fn test_parts_respect_options() {
        let parse = TokenHeuristic.parse("2 tsp salt, divided");
        let options = ParseOptions {
            include_modifiers: false,
            unit_style: UnitStyle::Canonical,
            ..ParseOptions::default()
        };
        let parts = parse.to_parts(&options);
        assert_eq!(
            parts,
            vec![
                (SegmentKind::Amount, "2".to_string()),
                (SegmentKind::Unit, "teaspoon".to_string()),
                (SegmentKind::Ingredient, "salt".to_string()),
            ]
        );
    }
}
