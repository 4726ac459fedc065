use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::context::{HEADER_DEVICE_ID, ReqCtx};
use crate::error::Error;
use crate::models::device::{
    AttributeValue, Device, DeviceAttribute, SCOPE_INVENTORY, SCOPE_TAGS, validate_group_name,
};
use crate::models::search::{Filter, FilterOp, SearchParams, Sort, SortOrder};

use super::pagination_headers;

/// Translate `GET /devices` query parameters into search parameters.
/// Reserved keys control pagination and grouping; any `<scope>/<name>` key is
/// an attribute filter with an optional `<op>:` value prefix (default `eq`).
pub(crate) fn parse_list_params(query: &HashMap<String, String>) -> Result<SearchParams, Error> {
    let mut params = SearchParams::default();
    for (key, value) in query {
        match key.as_str() {
            "page" => {
                params.page = value
                    .parse()
                    .map_err(|_| Error::validation("invalid page parameter"))?;
            }
            "per_page" => {
                params.per_page = value
                    .parse()
                    .map_err(|_| Error::validation("invalid per_page parameter"))?;
            }
            "sort" => {
                for entry in value.split(',') {
                    params.sort.push(parse_sort(entry)?);
                }
            }
            "has_group" => {
                params.has_group = Some(
                    value
                        .parse()
                        .map_err(|_| Error::validation("invalid has_group parameter"))?,
                );
            }
            "group" => {
                validate_group_name(value)?;
                params.group = Some(value.clone());
            }
            _ => {
                let Some((scope, attribute)) = key.split_once('/') else {
                    return Err(Error::validation(format!("unknown parameter {key}")));
                };
                params.filters.push(parse_filter(scope, attribute, value)?);
            }
        }
    }
    params.validate()?;
    Ok(params)
}

fn parse_sort(entry: &str) -> Result<Sort, Error> {
    let (field, order) = match entry.rsplit_once(':') {
        Some((field, "asc")) => (field, SortOrder::Asc),
        Some((field, "desc")) => (field, SortOrder::Desc),
        Some((_, other)) => {
            return Err(Error::validation(format!("invalid sort order {other}")));
        }
        None => (entry, SortOrder::Asc),
    };
    let Some((scope, attribute)) = field.split_once('/') else {
        return Err(Error::validation(
            "sort must have the form <scope>/<name>[:asc|desc]",
        ));
    };
    Ok(Sort {
        scope: scope.to_string(),
        attribute: attribute.to_string(),
        order,
    })
}

fn parse_filter(scope: &str, attribute: &str, value: &str) -> Result<Filter, Error> {
    let (operator, raw) = match value.split_once(':') {
        Some((op, rest)) => match FilterOp::from_query_op(op) {
            Some(operator) => (operator, rest),
            // a ':' inside a plain value, e.g. a mac address
            None => (FilterOp::Eq, value),
        },
        None => (FilterOp::Eq, value),
    };
    let value = if operator == FilterOp::Exists {
        serde_json::Value::Bool(
            raw.parse()
                .map_err(|_| Error::validation("exists filter requires true or false"))?,
        )
    } else {
        serde_json::Value::String(raw.to_string())
    };
    let filter = Filter {
        scope: scope.to_string(),
        attribute: attribute.to_string(),
        operator,
        value,
    };
    filter.validate()?;
    Ok(filter)
}

pub async fn list_devices(
    State(state): State<AppState>,
    ctx: ReqCtx,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, Error> {
    let params = parse_list_params(&query)?;
    let (devices, total) = state.service.search_devices(&ctx, &params).await?;

    let mut headers = HeaderMap::new();
    pagination_headers(
        &mut headers,
        uri.path(),
        uri.query(),
        params.page,
        params.per_page,
        total,
    );
    Ok((headers, Json(devices)))
}

pub async fn get_device(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
) -> Result<Json<Device>, Error> {
    match state.service.get_device(&ctx, &id).await? {
        Some(device) => Ok(Json(device)),
        None => Err(Error::DevNotFound),
    }
}

pub async fn add_device(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Json(device): Json<Device>,
) -> Result<impl IntoResponse, Error> {
    state.service.add_device(&ctx, &device).await?;
    let location = format!("devices/{}", device.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]))
}

pub async fn delete_device(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
) -> Result<StatusCode, Error> {
    state.service.delete_device(&ctx, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Tag payloads carry no scope; the endpoint pins it.
#[derive(Debug, Deserialize)]
pub struct TagAttribute {
    name: String,
    value: AttributeValue,
    #[serde(default)]
    description: Option<String>,
}

impl TagAttribute {
    fn into_attribute(self) -> DeviceAttribute {
        DeviceAttribute {
            name: self.name,
            scope: SCOPE_TAGS.to_string(),
            value: self.value,
            description: self.description,
        }
    }
}

fn if_match_etag(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}

pub async fn patch_tags(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(tags): Json<Vec<TagAttribute>>,
) -> Result<StatusCode, Error> {
    let attrs: Vec<DeviceAttribute> = tags.into_iter().map(TagAttribute::into_attribute).collect();
    let etag = if_match_etag(&headers);
    state
        .service
        .upsert_attributes_with_updated(&ctx, &id, &attrs, SCOPE_TAGS, etag.as_deref())
        .await?;
    Ok(StatusCode::OK)
}

pub async fn put_tags(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(tags): Json<Vec<TagAttribute>>,
) -> Result<StatusCode, Error> {
    let attrs: Vec<DeviceAttribute> = tags.into_iter().map(TagAttribute::into_attribute).collect();
    let etag = if_match_etag(&headers);
    state
        .service
        .replace_attributes(&ctx, &id, &attrs, SCOPE_TAGS, etag.as_deref())
        .await?;
    Ok(StatusCode::OK)
}

pub async fn get_device_alerts(
    State(state): State<AppState>,
    ctx: ReqCtx,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let alerts = state.service.check_alerts(&ctx, &id).await?;
    Ok(Json(json!({ "alerts": alerts })))
}

/// Attribute as reported by a device agent; scope defaults to `inventory`.
#[derive(Debug, Deserialize)]
pub struct ReportedAttribute {
    name: String,
    #[serde(default = "default_report_scope")]
    scope: String,
    value: AttributeValue,
    #[serde(default)]
    description: Option<String>,
}

fn default_report_scope() -> String {
    SCOPE_INVENTORY.to_string()
}

/// Device-facing endpoint: the reporting device's identity arrives in a
/// header, filled in upstream during token introspection.
pub async fn patch_device_attributes(
    State(state): State<AppState>,
    ctx: ReqCtx,
    headers: HeaderMap,
    Json(reported): Json<Vec<ReportedAttribute>>,
) -> Result<StatusCode, Error> {
    let device_id = headers
        .get(HEADER_DEVICE_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Unauthorized("missing device identity".to_string()))?
        .to_string();
    let attrs: Vec<DeviceAttribute> = reported
        .into_iter()
        .map(|a| DeviceAttribute {
            name: a.name,
            scope: a.scope,
            value: a.value,
            description: a.description,
        })
        .collect();
    state.service.upsert_attributes(&ctx, &device_id, &attrs).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_with_no_parameters() {
        let params = parse_list_params(&query(&[])).unwrap();
        assert_eq!(params.page, 1);
        assert_eq!(params.per_page, 20);
        assert!(params.filters.is_empty());
    }

    #[test]
    fn attribute_filters_parse_with_default_eq() {
        let params = parse_list_params(&query(&[("inventory/attrString", "val4")])).unwrap();
        assert_eq!(params.filters.len(), 1);
        let f = &params.filters[0];
        assert_eq!(f.scope, "inventory");
        assert_eq!(f.attribute, "attrString");
        assert_eq!(f.operator, FilterOp::Eq);
        assert_eq!(f.value, serde_json::json!("val4"));
    }

    #[test]
    fn explicit_operators_parse() {
        let params = parse_list_params(&query(&[("inventory/cpus", "gte:4")])).unwrap();
        assert_eq!(params.filters[0].operator, FilterOp::Gte);
        assert_eq!(params.filters[0].value, serde_json::json!("4"));

        let params = parse_list_params(&query(&[("system/group", "exists:true")])).unwrap();
        assert_eq!(params.filters[0].operator, FilterOp::Exists);
        assert_eq!(params.filters[0].value, serde_json::json!(true));
    }

    #[test]
    fn colon_values_without_operator_stay_eq() {
        let params = parse_list_params(&query(&[("identity/mac", "aa:bb:cc")])).unwrap();
        assert_eq!(params.filters[0].operator, FilterOp::Eq);
        assert_eq!(params.filters[0].value, serde_json::json!("aa:bb:cc"));
    }

    #[test]
    fn sort_parses_scope_name_and_order() {
        let params = parse_list_params(&query(&[("sort", "inventory/sn:desc")])).unwrap();
        assert_eq!(params.sort.len(), 1);
        assert_eq!(params.sort[0].order, SortOrder::Desc);

        let params = parse_list_params(&query(&[("sort", "inventory/sn")])).unwrap();
        assert_eq!(params.sort[0].order, SortOrder::Asc);

        assert!(parse_list_params(&query(&[("sort", "inventory/sn:sideways")])).is_err());
        assert!(parse_list_params(&query(&[("sort", "noslash:asc")])).is_err());
    }

    #[test]
    fn group_and_has_group_parse() {
        let params =
            parse_list_params(&query(&[("group", "g1"), ("has_group", "true")])).unwrap();
        assert_eq!(params.group.as_deref(), Some("g1"));
        assert_eq!(params.has_group, Some(true));

        assert!(parse_list_params(&query(&[("group", "bad name")])).is_err());
        assert!(parse_list_params(&query(&[("has_group", "maybe")])).is_err());
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        assert!(parse_list_params(&query(&[("bogus", "1")])).is_err());
        assert!(parse_list_params(&query(&[("page", "x")])).is_err());
    }

    #[test]
    fn etag_strips_quotes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, "\"E1\"".parse().unwrap());
        assert_eq!(if_match_etag(&headers).as_deref(), Some("E1"));

        headers.insert(header::IF_MATCH, "\"\"".parse().unwrap());
        assert_eq!(if_match_etag(&headers), None);
    }
}
