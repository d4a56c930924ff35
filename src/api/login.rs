// api/login.rs — simple identity collaborator.
//
// Interactive OpenID/OAuth flows live outside the core; this route is the
// boundary where a collaborator-supplied `(email, username)` identity
// enters. The first user ever created is promoted to admin.

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::ApiError;
use crate::identity;
use crate::AppContext;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    email: String,
    username: Option<String>,
}

/// Upserts the user, sets the signed session cookie, and returns the
/// record (including the API bearer token).
pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !body.email.contains('@') {
        return Err(ApiError::BadRequest(format!(
            "invalid email {}",
            body.email
        )));
    }
    let username = body
        .username
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| body.email.split('@').next().unwrap_or_default().to_string());

    let user = identity::login(&ctx.store, &body.email, &username).await?;
    let cookie = identity::session_cookie(&ctx.config, &user.email);
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "success": true, "data": user })),
    ))
}

pub async fn logout() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, identity::clear_cookie())],
        Json(json!({ "success": true, "description": "logged out" })),
    )
}
