use std::collections::HashMap;

use serde::Serialize;

use crate::ranking::{RankPage, RankedResult};

/// One ranked candidate on the wire. Scores are kept as raw fractions;
/// the explanation string carries the human-readable percentages.
#[derive(Debug, Clone, Serialize)]
pub struct RankItemView {
    pub candidate_id: i64,
    pub final_score: f64,
    pub semantic_score: f64,
    pub matched_keywords: Vec<String>,
    pub keyword_scores: HashMap<String, f64>,
    pub explanation: String,
}

impl From<RankedResult> for RankItemView {
    fn from(result: RankedResult) -> Self {
        Self {
            candidate_id: result.candidate_id,
            final_score: result.final_score,
            semantic_score: result.semantic_score,
            matched_keywords: result.matched_keywords,
            keyword_scores: result.keyword_scores,
            explanation: result.explanation,
        }
    }
}

/// JSON body returned by `POST /api/v1/rank`.
#[derive(Debug, Clone, Serialize)]
pub struct RankResponseBody {
    pub run_id: String,
    pub items: Vec<RankItemView>,
    pub page: usize,
    pub page_size: usize,
    pub pooled: usize,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<&'static str>,
}

impl From<RankPage> for RankResponseBody {
    fn from(page: RankPage) -> Self {
        Self {
            run_id: page.run_id,
            items: page.items.into_iter().map(RankItemView::from).collect(),
            page: page.page,
            page_size: page.page_size,
            pooled: page.pooled,
            degraded: page.degraded,
            fallback: page.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_omitted_when_absent() {
        let body = RankResponseBody {
            run_id: "01J0000000000000000000000".into(),
            items: Vec::new(),
            page: 1,
            page_size: 20,
            pooled: 0,
            degraded: true,
            fallback: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("fallback"));
        assert!(json.contains(r#""degraded":true"#));
    }
}
