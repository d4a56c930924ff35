// api/mod.rs — Public REST API server.
//
// Axum HTTP server; every JSON response uses the
// `{success, description?|data?|devices?}` envelope.
//
// Endpoints:
//   POST /login                                    (identity collaborator)
//   GET  /logout
//   GET  /api/v1/health
//   GET  /api/v1/devices
//   GET  /api/v1/devices/{udid}
//   GET/PUT /api/v1/devices/{udid}/properties
//   GET  /api/v1/user
//   GET/POST /api/v1/user/devices
//   GET/DELETE /api/v1/user/devices/{udid}
//   GET  /api/v1/user/devices/{udid}/active
//   POST /api/v1/user/groups
//   GET  /api/v1/groups/{id}/users
//   GET/POST /api/v1/admins

pub mod admins;
pub mod devices;
pub mod groups;
pub mod login;
pub mod user;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::identity::{self, IdentityError, Principal};
use crate::AppContext;

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("0.0.0.0:{}", ctx.config.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Health + identity (no auth)
        .route("/api/v1/health", get(health))
        .route("/login", post(login::login))
        .route("/logout", get(login::logout))
        // Devices
        .route("/api/v1/devices", get(devices::list))
        .route("/api/v1/devices/{udid}", get(devices::detail))
        .route(
            "/api/v1/devices/{udid}/properties",
            get(devices::get_properties).put(devices::put_properties),
        )
        // Current user
        .route("/api/v1/user", get(user::info))
        .route(
            "/api/v1/user/devices",
            get(user::list_leased).post(user::acquire),
        )
        .route(
            "/api/v1/user/devices/{udid}",
            get(user::device_detail).delete(user::release),
        )
        .route("/api/v1/user/devices/{udid}/active", get(user::activate))
        // Groups
        .route("/api/v1/user/groups", post(groups::create))
        .route("/api/v1/groups/{id}/users", get(groups::members))
        // Admin
        .route("/api/v1/admins", get(admins::list).post(admins::promote))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "providers": ctx.providers.len().await,
    }))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Business errors rendered as `{success:false, description}`; unexpected
/// errors are logged and surfaced as a bare 500.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, description) = match &self {
            ApiError::BadRequest(d) => (StatusCode::BAD_REQUEST, d.clone()),
            ApiError::Unauthorized(d) => (StatusCode::UNAUTHORIZED, d.clone()),
            ApiError::Forbidden(d) => (StatusCode::FORBIDDEN, d.clone()),
            ApiError::NotFound(d) => (StatusCode::NOT_FOUND, d.clone()),
            ApiError::Internal(e) => {
                tracing::error!(err = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (
            status,
            Json(json!({ "success": false, "description": description })),
        )
            .into_response()
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::InvalidToken => ApiError::Unauthorized(e.to_string()),
            IdentityError::Store(e) => ApiError::Internal(e),
        }
    }
}

// ─── Principal helpers ───────────────────────────────────────────────────────

pub(crate) async fn principal(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<Option<Principal>, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let cookie = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
    Ok(identity::resolve(&ctx.store, &ctx.config, authorization, cookie).await?)
}

pub(crate) async fn require_user(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    principal(ctx, headers)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("need to login".to_string()))
}

pub(crate) async fn require_admin(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<Principal, ApiError> {
    let p = require_user(ctx, headers).await?;
    if !p.admin {
        return Err(ApiError::Forbidden("admin required".to_string()));
    }
    Ok(p)
}

pub(crate) fn success(description: &str) -> Json<Value> {
    Json(json!({ "success": true, "description": description }))
}
