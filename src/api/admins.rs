// api/admins.rs — admin roster management.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{require_admin, success, ApiError};
use crate::AppContext;

/// Tokens and secrets are withheld from the roster.
pub async fn list(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx, &headers).await?;
    let admins: Vec<Value> = ctx
        .store
        .admins()
        .await?
        .into_iter()
        .map(|u| {
            json!({
                "email": u.email,
                "username": u.username,
                "createdAt": u.created_at,
                "lastLoggedInAt": u.last_logged_in_at,
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "data": admins })))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    email: String,
}

pub async fn promote(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<PromoteRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx, &headers).await?;
    if !ctx.store.set_admin(&body.email, true).await? {
        return Err(ApiError::BadRequest(format!(
            "user not found {}",
            body.email
        )));
    }
    Ok(success("User promoted to admin"))
}
