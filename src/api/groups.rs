// api/groups.rs — group creation and membership listing.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{require_user, success, ApiError};
use crate::auth;
use crate::AppContext;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    id: String,
    name: String,
}

/// The creator becomes the group's first group-admin.
pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Result<Json<Value>, ApiError> {
    let p = require_user(&ctx, &headers).await?;
    if !auth::valid_group_id(&body.id) {
        return Err(ApiError::BadRequest(
            "GroupID should not be empty or contain '@'".to_string(),
        ));
    }
    if !ctx
        .store
        .create_group(&body.id, &body.name, &p.email)
        .await?
    {
        return Err(ApiError::BadRequest(format!(
            "GroupID duplicated error, ID={}",
            body.id
        )));
    }
    Ok(success("Group successfully created"))
}

pub async fn members(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_user(&ctx, &headers).await?;
    let group = ctx
        .store
        .group(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("group not found {id}")))?;

    let mut members = Vec::new();
    for (email, role) in &group.members {
        let username = ctx
            .store
            .user(email)
            .await?
            .map(|u| u.username)
            .unwrap_or_default();
        members.push(json!({ "email": email, "username": username, "role": role }));
    }
    Ok(Json(json!({ "success": true, "data": members })))
}
