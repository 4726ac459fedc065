use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::context::ReqCtx;
use crate::error::Error;
use crate::models::device::ATTR_NAME_STATUS;
use crate::models::search::{Filter, FilterOp, UpdateResult};

use super::total_count_header;

pub async fn get_device_group(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let group = state.service.get_device_group(&ctx, &id).await?;
    Ok(Json(json!({ "group": group })))
}

#[derive(Debug, Deserialize)]
pub struct GroupBody {
    pub group: String,
}

pub async fn put_device_group(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
    Json(body): Json<GroupBody>,
) -> Result<StatusCode, Error> {
    state.service.update_device_group(&ctx, &id, &body.group).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_device_group(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path((id, name)): Path<(String, String)>,
) -> Result<StatusCode, Error> {
    state.service.unset_device_group(&ctx, &id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_groups(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<String>>, Error> {
    let mut filters = Vec::new();
    if let Some(status) = query.get("status") {
        filters.push(Filter {
            scope: "identity".to_string(),
            attribute: ATTR_NAME_STATUS.to_string(),
            operator: FilterOp::Eq,
            value: serde_json::Value::String(status.clone()),
        });
    }
    let groups = state.service.list_groups(&ctx, &filters).await?;
    Ok(Json(groups))
}

#[derive(Debug, Deserialize)]
pub struct GroupPageParams {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    crate::models::search::DEFAULT_PAGE
}

fn default_per_page() -> i64 {
    crate::models::search::DEFAULT_PER_PAGE
}

/// Device ids in the group, paginated, with the group total in the count
/// header.
pub async fn list_devices_by_group(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(name): Path<String>,
    Query(params): Query<GroupPageParams>,
) -> Result<impl IntoResponse, Error> {
    let (devices, total) = state
        .service
        .list_devices_by_group(&ctx, &name, params.page, params.per_page)
        .await?;
    let ids: Vec<String> = devices.into_iter().map(|d| d.id).collect();
    let mut headers = HeaderMap::new();
    total_count_header(&mut headers, total);
    Ok((headers, Json(ids)))
}

pub async fn assign_group_devices(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(name): Path<String>,
    Json(device_ids): Json<Vec<String>>,
) -> Result<Json<UpdateResult>, Error> {
    if device_ids.is_empty() {
        return Err(Error::validation("no device ids given"));
    }
    let res = state
        .service
        .update_devices_group(&ctx, &device_ids, &name)
        .await?;
    Ok(Json(res))
}

pub async fn clear_group_devices(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(name): Path<String>,
    Json(device_ids): Json<Vec<String>>,
) -> Result<Json<UpdateResult>, Error> {
    if device_ids.is_empty() {
        return Err(Error::validation("no device ids given"));
    }
    let res = state
        .service
        .unset_devices_group(&ctx, &device_ids, &name)
        .await?;
    Ok(Json(res))
}

pub async fn delete_group(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(name): Path<String>,
) -> Result<StatusCode, Error> {
    state.service.delete_group(&ctx, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}
