// api/devices.rs — fleet-wide device listing and properties.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::{require_admin, require_user, ApiError};
use crate::auth;
use crate::store::{DeviceQuery, Platform};
use crate::AppContext;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    platform: Option<String>,
    usable: Option<String>,
    present: Option<String>,
}

/// Clients pass flags as `true`/`1`; an empty value means unset.
fn parse_flag(value: &Option<String>) -> Option<bool> {
    match value.as_deref() {
        Some("true") | Some("1") => Some(true),
        Some("false") | Some("0") => Some(false),
        _ => None,
    }
}

/// Visible devices, newest first. `usable=true` narrows to
/// `present ∧ ¬using ∧ ¬colding`.
pub async fn list(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let query = DeviceQuery {
        platform: q
            .platform
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Platform::parse),
        usable: parse_flag(&q.usable),
        present: parse_flag(&q.present),
    };
    let devices = ctx
        .store
        .list_devices(&auth::visibility_of(&p), &query)
        .await?;
    let list: Vec<Value> = devices.iter().map(|d| d.api_json(false)).collect();
    Ok(Json(json!({
        "success": true,
        "data": { "devices": list, "count": list.len() }
    })))
}

/// Single device minus `sources`. An invisible device is
/// indistinguishable from a missing one.
pub async fn detail(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(udid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let device = ctx
        .store
        .device(&udid)
        .await?
        .filter(|d| auth::visible(&p, d))
        .ok_or_else(|| ApiError::NotFound(format!("device not found {udid}")))?;
    Ok(Json(json!({ "success": true, "data": device.api_json(false) })))
}

pub async fn get_properties(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(udid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let device = ctx
        .store
        .device(&udid)
        .await?
        .filter(|d| auth::visible(&p, d))
        .ok_or_else(|| ApiError::NotFound(format!("device not found {udid}")))?;
    Ok(Json(json!({ "success": true, "data": device.properties })))
}

/// Overwrites the whole bag. Admin only.
pub async fn put_properties(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(udid): Path<String>,
    Json(properties): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx, &headers).await?;
    if !ctx.store.set_properties(&udid, properties).await? {
        return Err(ApiError::NotFound(format!("device not found {udid}")));
    }
    Ok(super::success("Properties updated"))
}
