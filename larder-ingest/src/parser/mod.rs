//! Ingredient line parsing with memoization
//!
//! The fallback chain: a cached heuristic parse is accepted when its
//! confidence meets the threshold; otherwise the full grammar runs (also
//! cached, failures excluded). With `cache_results` off the grammar runs
//! directly. Grammar failures become a terminal error result.

pub mod grammar;
pub mod heuristic;
pub mod key;
pub mod types;
pub mod units;

pub use grammar::{GrammarError, IngredientGrammar, LineGrammar};
pub use heuristic::{HeuristicParse, HeuristicParser, TokenHeuristic};
pub use key::{cache_key, normalize, short_hash};
pub use types::{
    ParseOptions, ParseResult, Segment, SegmentKind, UnitStyle, ERROR_RULE, GRAMMAR_RULE,
    HEURISTIC_RULE,
};

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use larder_common::events::{ImportEvent, ProgressBroadcaster};

use crate::cache::{CacheOptions, ResultCache};

/// Cache operation name for heuristic results
pub const HEURISTIC_OP: &str = "parse";
/// Cache operation name for grammar results
pub const GRAMMAR_OP: &str = "grammar";

/// Parses ingredient lines through the result cache
pub struct LineParser {
    cache: Arc<ResultCache>,
    cache_options: CacheOptions,
    heuristic: Arc<dyn HeuristicParser>,
    grammar: Arc<dyn LineGrammar>,
    broadcaster: Arc<dyn ProgressBroadcaster>,
}

impl LineParser {
    /// Parser using the default token heuristic and ingredient grammar
    pub fn new(
        cache: Arc<ResultCache>,
        cache_options: CacheOptions,
        broadcaster: Arc<dyn ProgressBroadcaster>,
    ) -> Self {
        Self {
            cache,
            cache_options,
            heuristic: Arc::new(TokenHeuristic),
            grammar: Arc::new(IngredientGrammar::new()),
            broadcaster,
        }
    }

    /// Replace the pluggable parsers
    pub fn with_parsers(
        mut self,
        heuristic: Arc<dyn HeuristicParser>,
        grammar: Arc<dyn LineGrammar>,
    ) -> Self {
        self.heuristic = heuristic;
        self.grammar = grammar;
        self
    }

    pub async fn parse(&self, line: &str, options: &ParseOptions) -> ParseResult {
        self.parse_for_note(None, line, options).await
    }

    /// Parse on behalf of a note; the note id only tags the progress event
    pub async fn parse_for_note(
        &self,
        note_id: Option<&str>,
        line: &str,
        options: &ParseOptions,
    ) -> ParseResult {
        let started = Instant::now();

        let result = if options.cache_results {
            self.parse_cached(line, options, started).await
        } else {
            self.finish_grammar(line, self.grammar.parse(line, options), started)
        };

        self.broadcaster.publish(ImportEvent::LineParsed {
            note_id: note_id.map(str::to_string),
            line: line.to_string(),
            rule: result.rule.clone(),
            segment_count: result.segments.len(),
            processing_time_ms: result.processing_time_ms,
            timestamp: Utc::now(),
        });

        result
    }

    async fn parse_cached(
        &self,
        line: &str,
        options: &ParseOptions,
        started: Instant,
    ) -> ParseResult {
        let keys = cache_key(HEURISTIC_OP, line, options)
            .and_then(|h| cache_key(GRAMMAR_OP, line, options).map(|g| (h, g)));
        let (heuristic_key, grammar_key) = match keys {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Cache key derivation failed, parsing uncached");
                return self.finish_grammar(line, self.grammar.parse(line, options), started);
            }
        };

        let quick: HeuristicParse = self
            .cache
            .get_or_set(
                &heuristic_key,
                || async { self.heuristic.parse(line) },
                &self.cache_options,
            )
            .await;

        if quick.confidence >= options.confidence_threshold {
            debug!(line, confidence = quick.confidence, "Heuristic parse accepted");
            return ParseResult::from_parts(
                HEURISTIC_RULE,
                quick.to_parts(options),
                elapsed_ms(started),
            );
        }

        let parts = self
            .cache
            .get_or_try_set(
                &grammar_key,
                || async { self.grammar.parse(line, options) },
                &self.cache_options,
            )
            .await;
        self.finish_grammar(line, parts, started)
    }

    fn finish_grammar(
        &self,
        line: &str,
        parts: Result<Vec<(SegmentKind, String)>, GrammarError>,
        started: Instant,
    ) -> ParseResult {
        match parts {
            Ok(parts) => ParseResult::from_parts(GRAMMAR_RULE, parts, elapsed_ms(started)),
            Err(e) => {
                debug!(line, error = %e, "Line did not parse");
                ParseResult::error(elapsed_ms(started))
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySharedStore;
    use larder_common::events::{EventBus, NullBroadcaster};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingGrammar {
        calls: AtomicUsize,
    }

    impl LineGrammar for CountingGrammar {
        fn parse(
            &self,
            line: &str,
            options: &ParseOptions,
        ) -> Result<Vec<(SegmentKind, String)>, GrammarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            IngredientGrammar.parse(line, options)
        }
    }

    fn cache() -> Arc<ResultCache> {
        Arc::new(ResultCache::new(100, Arc::new(MemorySharedStore::new())))
    }

    fn parser(cache: Arc<ResultCache>) -> LineParser {
        LineParser::new(
            cache,
            CacheOptions::new(Duration::from_secs(60), Duration::from_secs(10)),
            Arc::new(NullBroadcaster),
        )
    }

    fn values(result: &ParseResult) -> Vec<(&str, &str)> {
        result
            .segments
            .iter()
            .map(|s| (s.kind.as_str(), s.value.as_str()))
            .collect()
    }

    #[tokio::test]
    async fn test_uncached_parse_runs_grammar_directly() {
        let cache = cache();
        let parser = parser(cache.clone());

        let result = parser.parse("1 cup flour", &ParseOptions::uncached()).await;

        assert_eq!(result.rule, GRAMMAR_RULE);
        assert_eq!(
            values(&result),
            vec![("amount", "1"), ("unit", "cup"), ("ingredient", "flour")]
        );
        let stats = cache.get_stats().await;
        assert_eq!(stats.hits + stats.misses, 0);
    }

    #[tokio::test]
    async fn test_uncached_parse_never_memoizes() {
        let grammar = Arc::new(CountingGrammar {
            calls: AtomicUsize::new(0),
        });
        let parser = parser(cache()).with_parsers(Arc::new(TokenHeuristic), grammar.clone());

        parser.parse("1 cup flour", &ParseOptions::uncached()).await;
        parser.parse("1 cup flour", &ParseOptions::uncached()).await;

        assert_eq!(grammar.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_confident_heuristic_is_used_and_cached() {
        let cache = cache();
        let grammar = Arc::new(CountingGrammar {
            calls: AtomicUsize::new(0),
        });
        let parser = parser(cache.clone()).with_parsers(Arc::new(TokenHeuristic), grammar.clone());

        let first = parser.parse("1 cup flour", &ParseOptions::default()).await;
        let second = parser.parse("1 cup flour", &ParseOptions::default()).await;

        assert_eq!(first.rule, HEURISTIC_RULE);
        assert_eq!(values(&first), values(&second));
        assert_eq!(grammar.calls.load(Ordering::SeqCst), 0);
        let stats = cache.get_stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_falls_back_to_cached_grammar() {
        let grammar = Arc::new(CountingGrammar {
            calls: AtomicUsize::new(0),
        });
        let parser = parser(cache()).with_parsers(Arc::new(TokenHeuristic), grammar.clone());

        let result = parser.parse("2 (14 oz) cans tomatoes", &ParseOptions::default()).await;
        parser.parse("2 (14 oz) cans tomatoes", &ParseOptions::default()).await;

        assert_eq!(result.rule, GRAMMAR_RULE);
        assert_eq!(result.value_of(SegmentKind::Note), Some("14 oz"));
        assert_eq!(grammar.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_line_becomes_error_result_and_is_not_cached() {
        let grammar = Arc::new(CountingGrammar {
            calls: AtomicUsize::new(0),
        });
        let parser = parser(cache()).with_parsers(Arc::new(TokenHeuristic), grammar.clone());

        let result = parser.parse("2 cups", &ParseOptions::default()).await;
        assert!(result.is_error());
        assert_eq!(result.kind, "error");
        assert!(result.segments.is_empty());

        parser.parse("2 cups", &ParseOptions::default()).await;
        assert_eq!(grammar.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_option_change_is_a_distinct_entry() {
        let parser = parser(cache());

        let verbatim = parser.parse("2 Tbsp butter", &ParseOptions::default()).await;
        let canonical = parser
            .parse(
                "2 Tbsp butter",
                &ParseOptions {
                    unit_style: UnitStyle::Canonical,
                    ..ParseOptions::default()
                },
            )
            .await;

        assert_eq!(verbatim.value_of(SegmentKind::Unit), Some("Tbsp"));
        assert_eq!(canonical.value_of(SegmentKind::Unit), Some("tablespoon"));
    }

    #[tokio::test]
    async fn test_parse_publishes_line_parsed() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let parser = LineParser::new(cache(), CacheOptions::default(), Arc::new(bus));

        parser
            .parse_for_note(Some("N1"), "1 cup flour", &ParseOptions::default())
            .await;

        match rx.try_recv().unwrap() {
            ImportEvent::LineParsed {
                note_id,
                segment_count,
                ..
            } => {
                assert_eq!(note_id.as_deref(), Some("N1"));
                assert_eq!(segment_count, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
