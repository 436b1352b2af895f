use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::CandidateProfile;

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{Alphabetic}\p{N}+#.]+").unwrap());

/// Tokens too generic to carry keyword evidence. Length-2-and-under
/// tokens are dropped before this list is consulted.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "and", "are", "for", "from", "has", "have", "her", "his", "its", "not", "our", "the",
        "their", "this", "was", "were", "who", "will", "with", "you", "your", "about", "all",
        "any", "can", "each", "into", "more", "other", "some", "than", "that", "them", "then",
        "they", "when", "which", "years", "year", "experience", "experienced", "looking",
        "candidate", "candidates", "someone", "strong", "senior", "junior",
    ]
    .into_iter()
    .collect()
});

/// A parsed search query: raw text plus the extracted keyword set
/// (ordered, deduped, lowercase).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub raw: String,
    pub tenant_id: String,
    pub keywords: Vec<String>,
}

impl SearchQuery {
    pub fn parse(raw: &str, tenant_id: &str) -> Self {
        Self {
            raw: raw.to_string(),
            tenant_id: tenant_id.to_string(),
            keywords: extract_keywords(raw),
        }
    }
}

fn normalize_token(token: &str) -> String {
    // NFKC folds full-width forms so "Ｒｕｓｔ" and "Rust" extract identically.
    token.nfkc().collect::<String>().to_lowercase()
}

/// Split on whitespace/punctuation, lowercase, drop short and
/// stop-listed tokens, dedupe while preserving first-seen order.
pub fn extract_keywords(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for token in RE_TOKEN.find_iter(raw) {
        let normalized = normalize_token(token.as_str());
        // Trailing sentence punctuation survives the token class ("node.js." style).
        let normalized = normalized.trim_matches('.').to_string();
        if normalized.chars().count() <= 2 || STOP_WORDS.contains(normalized.as_str()) {
            continue;
        }
        if seen.insert(normalized.clone()) {
            keywords.push(normalized);
        }
    }

    keywords
}

fn tokenize(text: &str) -> Vec<String> {
    RE_TOKEN
        .find_iter(text)
        .map(|token| normalize_token(token.as_str()).trim_matches('.').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

fn body_frequency_score(occurrences: usize) -> f64 {
    match occurrences {
        0 => 0.0,
        1 => 0.5,
        2..=4 => 0.7,
        _ => 0.9,
    }
}

/// Score one keyword against a candidate. Evidence sources never sum:
/// the strongest single source wins.
///
/// - exact token match in the title/role field → 1.0
/// - exact match in the skill list → 0.95
/// - body frequency: >=5 → 0.9, 2..4 → 0.7, 1 → 0.5, 0 → 0.0
pub fn score_keyword(keyword: &str, profile: &KeywordIndex) -> f64 {
    let mut score: f64 = 0.0;

    if profile.title_tokens.contains(keyword) {
        score = score.max(1.0);
    }
    if profile.skills.contains(keyword) {
        score = score.max(0.95);
    }
    let occurrences = profile.body_counts.get(keyword).copied().unwrap_or(0);
    score = score.max(body_frequency_score(occurrences));

    score
}

/// Pre-tokenized view of a candidate so a keyword set can be scored
/// without re-scanning the profile text per keyword.
#[derive(Debug, Clone)]
pub struct KeywordIndex {
    title_tokens: HashSet<String>,
    skills: HashSet<String>,
    body_counts: HashMap<String, usize>,
}

impl KeywordIndex {
    pub fn build(profile: &CandidateProfile) -> Self {
        let title_tokens = tokenize(&profile.title).into_iter().collect();
        let skills = profile
            .skills
            .iter()
            .map(|skill| normalize_token(skill.trim()))
            .collect();

        let mut body_counts: HashMap<String, usize> = HashMap::new();
        for token in tokenize(&profile.body) {
            *body_counts.entry(token).or_insert(0) += 1;
        }

        Self {
            title_tokens,
            skills,
            body_counts,
        }
    }
}

/// Score every query keyword against a candidate.
pub fn score_keywords(keywords: &[String], profile: &CandidateProfile) -> HashMap<String, f64> {
    let index = KeywordIndex::build(profile);
    keywords
        .iter()
        .map(|keyword| (keyword.clone(), score_keyword(keyword, &index)))
        .collect()
}

/// Case-insensitive substring check used by the last-resort keyword
/// fallback. Any keyword hit counts.
pub fn matches_any_keyword(keywords: &[String], profile: &CandidateProfile) -> bool {
    let haystack = profile.profile_text().to_lowercase();
    keywords.iter().any(|keyword| haystack.contains(keyword))
}
