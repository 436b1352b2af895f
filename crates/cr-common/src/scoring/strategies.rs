use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Closed set of scoring strategies. Adding a strategy means adding a
/// variant here and a pure function in the dispatch table below; there
/// is deliberately no trait object in this path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Full coverage scores 1.0, anything less falls back to the raw
    /// semantic score.
    AllOrNothing,
    /// Coverage-tiered blend of keyword quality and semantic score.
    /// The documented default for tenants without explicit config.
    #[default]
    Tiered,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::AllOrNothing => "all_or_nothing",
            StrategyKind::Tiered => "tiered",
        }
    }

    /// Parse a stored strategy name. Unknown names return `None` so the
    /// caller can log and fall back to the default.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "all_or_nothing" => Some(StrategyKind::AllOrNothing),
            "tiered" => Some(StrategyKind::Tiered),
            _ => None,
        }
    }
}

/// Input to a strategy function. `keyword_scores` may omit keys; a
/// missing key counts as 0.0 against `total_keywords`.
#[derive(Debug, Clone)]
pub struct StrategyInput<'a> {
    pub keyword_scores: &'a HashMap<String, f64>,
    pub semantic_score: f64,
    pub total_keywords: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchLabel {
    ExcellentMatch,
    GoodMatch,
    SemanticMatch,
}

impl MatchLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchLabel::ExcellentMatch => "Excellent match",
            MatchLabel::GoodMatch => "Good match",
            MatchLabel::SemanticMatch => "Semantic match",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub final_score: f64,
    pub label: MatchLabel,
    pub matched_keywords: Vec<String>,
    pub explanation: String,
}

struct CoverageStats {
    matched: Vec<String>,
    coverage: f64,
    avg_quality: f64,
}

fn coverage_stats(input: &StrategyInput<'_>) -> CoverageStats {
    if input.total_keywords == 0 {
        return CoverageStats {
            matched: Vec::new(),
            coverage: 0.0,
            avg_quality: 0.0,
        };
    }

    let mut matched: Vec<String> = input
        .keyword_scores
        .iter()
        .filter(|(_, score)| **score > 0.0)
        .map(|(keyword, _)| keyword.clone())
        .collect();
    matched.sort();

    let sum: f64 = input.keyword_scores.values().sum();
    let total = input.total_keywords as f64;

    CoverageStats {
        coverage: matched.len() as f64 / total,
        avg_quality: sum / total,
        matched,
    }
}

fn build_explanation(
    label: MatchLabel,
    matched: &[String],
    total_keywords: usize,
    coverage: f64,
    final_score: f64,
) -> String {
    let matched_list = if matched.is_empty() {
        "none".to_string()
    } else {
        matched.join(", ")
    };

    format!(
        "{}: {}/{} keywords matched ({:.0}% coverage), final score {:.0}%. Matched: {}",
        label.as_str(),
        matched.len(),
        total_keywords,
        coverage * 100.0,
        final_score * 100.0,
        matched_list
    )
}

/// Strict queries must not be inflated by partial coverage: full
/// coverage pins the score to 1.0, anything else trusts the semantic
/// score unchanged.
fn all_or_nothing(input: &StrategyInput<'_>) -> StrategyOutcome {
    let stats = coverage_stats(input);
    let full_coverage = input.total_keywords > 0 && stats.coverage >= 1.0;

    let (final_score, label) = if full_coverage {
        (1.0, MatchLabel::ExcellentMatch)
    } else {
        (input.semantic_score.clamp(0.0, 1.0), MatchLabel::SemanticMatch)
    };

    StrategyOutcome {
        final_score,
        label,
        explanation: build_explanation(
            label,
            &stats.matched,
            input.total_keywords,
            stats.coverage,
            final_score,
        ),
        matched_keywords: stats.matched,
    }
}

/// Tier boundaries by coverage:
/// - tier 1, coverage == 1.0: `max(0.85, avg*0.7 + semantic*0.3)` — an
///   85% floor whenever every requested keyword is present.
/// - tier 2, 0.5 <= coverage < 1.0: `avg*coverage*0.6 + semantic*0.4`.
/// - tier 3, coverage < 0.5 (including zero keywords): `semantic*0.8`.
fn tiered(input: &StrategyInput<'_>) -> StrategyOutcome {
    let stats = coverage_stats(input);
    let semantic = input.semantic_score.clamp(0.0, 1.0);

    let (raw, label) = if input.total_keywords > 0 && stats.coverage >= 1.0 {
        (
            (stats.avg_quality * 0.7 + semantic * 0.3).max(0.85),
            MatchLabel::ExcellentMatch,
        )
    } else if stats.coverage >= 0.5 {
        (
            stats.avg_quality * stats.coverage * 0.6 + semantic * 0.4,
            MatchLabel::GoodMatch,
        )
    } else {
        (semantic * 0.8, MatchLabel::SemanticMatch)
    };

    let final_score = raw.clamp(0.0, 1.0);

    StrategyOutcome {
        final_score,
        label,
        explanation: build_explanation(
            label,
            &stats.matched,
            input.total_keywords,
            stats.coverage,
            final_score,
        ),
        matched_keywords: stats.matched,
    }
}

/// Dispatch table. Pure: identical inputs always produce identical
/// outcomes.
pub fn apply_strategy(kind: StrategyKind, input: &StrategyInput<'_>) -> StrategyOutcome {
    match kind {
        StrategyKind::AllOrNothing => all_or_nothing(input),
        StrategyKind::Tiered => tiered(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn apply(kind: StrategyKind, pairs: &[(&str, f64)], semantic: f64, total: usize) -> StrategyOutcome {
        let keyword_scores = scores(pairs);
        apply_strategy(
            kind,
            &StrategyInput {
                keyword_scores: &keyword_scores,
                semantic_score: semantic,
                total_keywords: total,
            },
        )
    }

    #[test]
    fn all_or_nothing_full_coverage_pins_to_one() {
        let outcome = apply(
            StrategyKind::AllOrNothing,
            &[("k8s", 1.0), ("go", 0.9)],
            0.5,
            2,
        );
        assert_eq!(outcome.final_score, 1.0);
        assert_eq!(outcome.label, MatchLabel::ExcellentMatch);
    }

    #[test]
    fn all_or_nothing_partial_coverage_passes_semantic_through() {
        let outcome = apply(
            StrategyKind::AllOrNothing,
            &[("k8s", 1.0), ("go", 0.0)],
            0.6,
            2,
        );
        assert_eq!(outcome.final_score, 0.6);
        assert_eq!(outcome.label, MatchLabel::SemanticMatch);
        assert_eq!(outcome.matched_keywords, vec!["k8s".to_string()]);
    }

    #[test]
    fn tiered_tier1_rewards_quality_above_floor() {
        let outcome = apply(
            StrategyKind::Tiered,
            &[("a", 1.0), ("b", 0.9), ("c", 0.85)],
            0.92,
            3,
        );
        // avg ~0.9166; 0.9166*0.7 + 0.92*0.3 = 0.9177
        assert!((outcome.final_score - 0.9177).abs() < 1e-3);
        assert_eq!(outcome.label, MatchLabel::ExcellentMatch);
    }

    #[test]
    fn tiered_tier1_applies_085_floor() {
        let outcome = apply(
            StrategyKind::Tiered,
            &[("a", 0.5), ("b", 0.5), ("c", 0.5)],
            0.60,
            3,
        );
        // raw formula gives 0.53, floor wins
        assert_eq!(outcome.final_score, 0.85);
    }

    #[test]
    fn tiered_tier2_blends_quality_coverage_and_semantic() {
        let outcome = apply(
            StrategyKind::Tiered,
            &[("a", 1.0), ("b", 0.0), ("c", 0.8)],
            0.70,
            3,
        );
        // coverage 2/3, avg 0.6: 0.6*0.6667*0.6 + 0.7*0.4 = 0.52
        assert!((outcome.final_score - 0.52).abs() < 1e-3);
        assert_eq!(outcome.label, MatchLabel::GoodMatch);
    }

    #[test]
    fn tiered_tier3_scales_semantic_by_08() {
        let outcome = apply(
            StrategyKind::Tiered,
            &[("a", 0.0), ("b", 0.0), ("c", 0.0)],
            0.75,
            3,
        );
        assert!((outcome.final_score - 0.60).abs() < 1e-9);
        assert_eq!(outcome.label, MatchLabel::SemanticMatch);
    }

    #[test]
    fn coverage_exactly_half_routes_to_tier2() {
        let outcome = apply(
            StrategyKind::Tiered,
            &[("a", 0.8), ("b", 0.0)],
            0.4,
            2,
        );
        assert_eq!(outcome.label, MatchLabel::GoodMatch);
        // avg 0.4, coverage 0.5: 0.4*0.5*0.6 + 0.4*0.4 = 0.28
        assert!((outcome.final_score - 0.28).abs() < 1e-9);
    }

    #[test]
    fn zero_keywords_routes_to_tier3() {
        let outcome = apply(StrategyKind::Tiered, &[], 0.9, 0);
        assert_eq!(outcome.label, MatchLabel::SemanticMatch);
        assert!((outcome.final_score - 0.72).abs() < 1e-9);
    }

    #[test]
    fn tier3_is_monotone_in_semantic_score() {
        let empty = scores(&[("a", 0.0), ("b", 0.0), ("c", 0.0)]);
        let mut last = 0.0;
        for step in 0..=10 {
            let semantic = step as f64 / 10.0;
            let outcome = apply_strategy(
                StrategyKind::Tiered,
                &StrategyInput {
                    keyword_scores: &empty,
                    semantic_score: semantic,
                    total_keywords: 3,
                },
            );
            assert!(outcome.final_score >= last);
            assert!((outcome.final_score - semantic * 0.8).abs() < 1e-9);
            last = outcome.final_score;
        }
    }

    #[test]
    fn scores_stay_in_unit_interval_for_extreme_inputs() {
        for kind in [StrategyKind::AllOrNothing, StrategyKind::Tiered] {
            for semantic in [-0.5, 0.0, 0.5, 1.0, 1.5] {
                let outcome = apply(kind, &[("a", 1.0), ("b", 1.0)], semantic, 2);
                assert!((0.0..=1.0).contains(&outcome.final_score));
            }
        }
    }

    #[test]
    fn identical_inputs_are_deterministic() {
        let first = apply(StrategyKind::Tiered, &[("a", 0.7), ("b", 0.9)], 0.42, 2);
        let second = apply(StrategyKind::Tiered, &[("a", 0.7), ("b", 0.9)], 0.42, 2);
        assert_eq!(first.final_score, second.final_score);
        assert_eq!(first.explanation, second.explanation);
    }

    #[test]
    fn explanation_reports_counts_coverage_and_matches() {
        let outcome = apply(
            StrategyKind::Tiered,
            &[("rust", 1.0), ("k8s", 0.0)],
            0.4,
            2,
        );
        assert!(outcome.explanation.starts_with("Good match"));
        assert!(outcome.explanation.contains("1/2 keywords"));
        assert!(outcome.explanation.contains("50% coverage"));
        assert!(outcome.explanation.contains("Matched: rust"));
    }

    #[test]
    fn strategy_names_round_trip() {
        assert_eq!(StrategyKind::parse("tiered"), Some(StrategyKind::Tiered));
        assert_eq!(
            StrategyKind::parse("ALL_OR_NOTHING"),
            Some(StrategyKind::AllOrNothing)
        );
        assert_eq!(StrategyKind::parse("bogus"), None);
        assert_eq!(StrategyKind::default().as_str(), "tiered");
    }
}
