use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::AppState;
use crate::context::ReqCtx;
use crate::error::Error;
use crate::models::device::{
    ATTR_NAME_STATUS, AttributeValue, DeviceAttribute, DeviceUpdate, SCOPE_IDENTITY,
};
use crate::models::search::UpdateResult;

#[derive(Debug, Deserialize)]
pub struct NewTenant {
    pub tenant_id: String,
}

pub async fn create_tenant(
    State(state): State<AppState>,
    Json(tenant): Json<NewTenant>,
) -> Result<StatusCode, Error> {
    state.service.create_tenant(&tenant.tenant_id).await?;
    Ok(StatusCode::CREATED)
}

/// Internal batch endpoint: set the identity status of many devices at once,
/// guarded by each device's report revision.
pub async fn update_devices_status(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path((tenant_id, status)): Path<(String, String)>,
    Json(updates): Json<Vec<DeviceUpdate>>,
) -> Result<Json<UpdateResult>, Error> {
    if status.is_empty() {
        return Err(Error::validation("status cannot be empty"));
    }
    if updates.is_empty() {
        return Err(Error::validation("no device updates given"));
    }
    // the path names the tenant on internal calls
    let ctx = if tenant_id.is_empty() {
        ctx.require_tenant()?;
        ctx
    } else {
        ReqCtx {
            tenant_id: Some(tenant_id),
            ..ctx
        }
    };
    let attrs = vec![DeviceAttribute::new(
        SCOPE_IDENTITY,
        ATTR_NAME_STATUS,
        AttributeValue::Str(status),
    )];
    let res = state
        .service
        .upsert_devices_statuses(&ctx, &updates, &attrs)
        .await?;
    Ok(Json(res))
}
