use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;

use crate::AppState;
use crate::context::ReqCtx;
use crate::error::Error;
use crate::models::search::{FilterAttribute, SearchParams};

use super::total_count_header;

/// Full search surface: filter, sort, project, paginate and count in one
/// round trip.
pub async fn search_devices(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Json(params): Json<SearchParams>,
) -> Result<impl IntoResponse, Error> {
    let (devices, total) = state.service.search_devices(&ctx, &params).await?;
    let mut headers = HeaderMap::new();
    total_count_header(&mut headers, total);
    Ok((headers, Json(devices)))
}

/// Frequency-ranked filterable attributes for the search UI.
pub async fn get_filters_attributes(
    State(state): State<AppState>,
    ctx: ReqCtx,
) -> Result<Json<Vec<FilterAttribute>>, Error> {
    let attrs = state.service.get_filters_attributes(&ctx).await?;
    Ok(Json(attrs))
}
