// api/user.rs — current-user endpoints: profile, leases, acquire/release.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{require_user, success, ApiError};
use crate::coordinator::ReleaseActor;
use crate::errors::{AcquireError, ReleaseError};
use crate::AppContext;

/// Self plus group memberships, with the caller's role in each group.
pub async fn info(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let user = ctx
        .store
        .user(&p.email)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user not found {}", p.email)))?;
    let groups: Vec<Value> = ctx
        .store
        .groups_of(&p.email)
        .await?
        .into_iter()
        .map(|g| {
            let role = g.members.get(&p.email).copied();
            json!({
                "id": g.id,
                "name": g.name,
                "creator": g.creator,
                "createdAt": g.created_at,
                "role": role,
            })
        })
        .collect();

    let mut data = serde_json::to_value(&user).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut data {
        map.insert("groups".to_string(), Value::Array(groups));
    }
    Ok(Json(json!({ "success": true, "data": data })))
}

pub async fn list_leased(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let devices = ctx.store.leased_devices(&p.email).await?;
    let list: Vec<Value> = devices.iter().map(|d| d.api_json(false)).collect();
    Ok(Json(json!({ "success": true, "devices": list })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequest {
    udid: String,
    idle_timeout: Option<i64>,
    /// Admin-only: lease on behalf of this user.
    email: Option<String>,
}

pub async fn acquire(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<AcquireRequest>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let lease_email = match body.email {
        Some(email) if email != p.email => {
            if !p.admin {
                return Err(ApiError::Forbidden(
                    "only admins may lease on behalf of another user".to_string(),
                ));
            }
            email
        }
        _ => p.email.clone(),
    };
    let idle_timeout = body
        .idle_timeout
        .unwrap_or(ctx.config.default_idle_timeout);

    match ctx
        .coordinator
        .acquire(&p, &lease_email, &body.udid, idle_timeout)
        .await
    {
        Ok(()) => Ok(success("Device successfully added")),
        Err(AcquireError::Store(e)) => Err(ApiError::Internal(e)),
        Err(e) => Err(ApiError::Forbidden(format!("Device add failed: {e}"))),
    }
}

/// Device detail for the lessee, including the best source's
/// connection endpoints.
pub async fn device_detail(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(udid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let device = ctx
        .store
        .device(&udid)
        .await?
        .ok_or_else(|| ApiError::BadRequest(format!("device not found {udid}")))?;
    if !p.admin && device.user_id.as_deref() != Some(p.email.as_str()) {
        return Err(ApiError::Forbidden(
            "you have to acquire it before accessing device info".to_string(),
        ));
    }
    let mut data = device.api_json(false);
    if let Value::Object(map) = &mut data {
        let source = device
            .best_source()
            .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        map.insert("source".to_string(), source);
    }
    Ok(Json(json!({ "success": true, "data": data })))
}

/// Admins may release any device; releasing an idle device succeeds
/// idempotently.
pub async fn release(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(udid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    let actor = if p.admin {
        ReleaseActor::Admin
    } else {
        ReleaseActor::User(p.email.clone())
    };
    match ctx.coordinator.release(&udid, &actor).await {
        Ok(()) => Ok(success("Device successfully released")),
        Err(ReleaseError::Store(e)) => Err(ApiError::Internal(e)),
        Err(e) => Err(ApiError::Forbidden(format!("Device release failed: {e}"))),
    }
}

/// Lessee keepalive.
pub async fn activate(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(udid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    if ctx.coordinator.activate(&p.email, &udid).await? {
        Ok(success("Device activated time is updated"))
    } else {
        Err(ApiError::BadRequest("Device is not owned by you".to_string()))
    }
}
