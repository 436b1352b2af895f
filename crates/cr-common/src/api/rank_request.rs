use serde::Deserialize;

use crate::ranking::RankRequest;

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// JSON body of `POST /api/v1/rank`.
#[derive(Debug, Clone, Deserialize)]
pub struct RankRequestBody {
    pub query: String,
    pub tenant_id: String,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Optional per-request deadline override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl From<RankRequestBody> for RankRequest {
    fn from(body: RankRequestBody) -> Self {
        RankRequest {
            query: body.query,
            tenant_id: body.tenant_id,
            page: body.page,
            page_size: body.page_size,
            timeout_ms: body.timeout_ms,
        }
    }
}
