use axum::{Json, extract::State};

use cr_common::api::{RankRequestBody, RankResponseBody};
use cr_common::ranking::RankRequest;

use crate::SharedState;
use crate::error::ApiError;

pub async fn rank(
    State(state): State<SharedState>,
    Json(body): Json<RankRequestBody>,
) -> Result<Json<RankResponseBody>, ApiError> {
    let request = RankRequest::from(body);
    let page = state.engine.rank(&request).await?;
    Ok(Json(RankResponseBody::from(page)))
}
