//! Cache key derivation
//!
//! `key = operation + ":" + normalize(input) + "_" + short_hash(options)`
//!
//! Normalization lowercases and trims only; internal whitespace is kept, so
//! "1 cup  flour" and "1 cup flour" are distinct entries.

use serde::Serialize;
use sha2::{Digest, Sha256};

use larder_common::Result;

/// Lowercase and trim
pub fn normalize(input: &str) -> String {
    input.trim().to_lowercase()
}

/// First 8 hex characters of the SHA-256 of the options' JSON form
pub fn short_hash<O: Serialize>(options: &O) -> Result<String> {
    let bytes = serde_json::to_vec(options)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().take(4).map(|b| format!("{:02x}", b)).collect())
}

/// Deterministic cache key for an operation over an input line
pub fn cache_key<O: Serialize>(operation: &str, input: &str, options: &O) -> Result<String> {
    Ok(format!(
        "{}:{}_{}",
        operation,
        normalize(input),
        short_hash(options)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ParseOptions, UnitStyle};

    #[test]
    fn test_equal_arguments_yield_equal_keys() {
        let options = ParseOptions::default();
        let a = cache_key("parse", "1 cup flour", &options).unwrap();
        let b = cache_key("parse", "1 cup flour", &options.clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_shape() {
        let key = cache_key("parse", "  1 Cup Flour ", &ParseOptions::default()).unwrap();
        let (head, hash) = key.rsplit_once('_').unwrap();
        assert_eq!(head, "parse:1 cup flour");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_internal_whitespace_is_significant() {
        let options = ParseOptions::default();
        assert_ne!(
            cache_key("parse", "1 cup  flour", &options).unwrap(),
            cache_key("parse", "1 cup flour", &options).unwrap()
        );
    }

    #[test]
    fn test_every_option_field_changes_the_key() {
        let base = ParseOptions::default();
        let base_key = cache_key("parse", "1 cup flour", &base).unwrap();

        let variants = vec![
            ParseOptions { cache_results: !base.cache_results, ..base.clone() },
            ParseOptions { confidence_threshold: 0.5, ..base.clone() },
            ParseOptions { include_modifiers: !base.include_modifiers, ..base.clone() },
            ParseOptions { unit_style: UnitStyle::Canonical, ..base.clone() },
        ];

        for variant in variants {
            let key = cache_key("parse", "1 cup flour", &variant).unwrap();
            assert_ne!(key, base_key, "options {:?} reused the base key", variant);
        }
    }

    #[test]
    fn test_operation_name_separates_entries() {
        let options = ParseOptions::default();
        assert_ne!(
            cache_key("parse", "1 cup flour", &options).unwrap(),
            cache_key("grammar", "1 cup flour", &options).unwrap()
        );
    }
}
