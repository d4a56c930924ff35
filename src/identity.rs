//! Principal resolution and interactive login.
//!
//! Every request resolves to a principal in this order: `Authorization:
//! Bearer <token>` (rejected outright when the token matches no unique
//! user), the signed `user_id` cookie, else anonymous. Interactive login is
//! fed by an external collaborator that produces `(email, username)`; this
//! module owns the upsert, token generation, and first-admin promotion.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::Config;
use crate::store::{Store, User};

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "user_id";

/// Signed cookies older than this are ignored.
const COOKIE_MAX_AGE_SECS: i64 = 31 * 24 * 3600;

/// The resolved identity of a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub email: String,
    pub username: String,
    pub admin: bool,
    /// Ids of the groups this user belongs to, in any role.
    pub groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    /// A bearer token was presented but matched no unique user.
    #[error("invalid or unknown bearer token")]
    InvalidToken,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Resolve the principal for a request from its `Authorization` and
/// `Cookie` header values. `Ok(None)` means anonymous.
pub async fn resolve(
    store: &Store,
    config: &Config,
    authorization: Option<&str>,
    cookie: Option<&str>,
) -> Result<Option<Principal>, IdentityError> {
    if let Some(auth) = authorization {
        let token = auth
            .strip_prefix("Bearer ")
            .ok_or(IdentityError::InvalidToken)?;
        let user = store
            .user_by_token(token)
            .await?
            .ok_or(IdentityError::InvalidToken)?;
        return Ok(Some(principal_for(store, user).await?));
    }

    if let Some(email) = cookie
        .and_then(|c| cookie_value(c, COOKIE_NAME))
        .and_then(|signed| verify_value(&config.cookie_secret, &signed))
    {
        if let Some(user) = store.user(&email).await? {
            return Ok(Some(principal_for(store, user).await?));
        }
    }

    Ok(None)
}

async fn principal_for(store: &Store, user: User) -> Result<Principal, anyhow::Error> {
    let groups = store
        .groups_of(&user.email)
        .await?
        .into_iter()
        .map(|g| g.id)
        .collect();
    Ok(Principal {
        email: user.email,
        username: user.username,
        admin: user.admin,
        groups,
    })
}

/// Interactive login: upsert the user and return the record. Token and
/// secret generation and first-admin promotion happen on insert.
pub async fn login(store: &Store, email: &str, username: &str) -> Result<User, anyhow::Error> {
    let (user, inserted) = store.upsert_login(email, username).await?;
    if inserted {
        tracing::info!(email = %user.email, admin = user.admin, "new user created");
    }
    Ok(user)
}

/// `Set-Cookie` value establishing the signed session cookie.
pub fn session_cookie(config: &Config, email: &str) -> String {
    format!(
        "{COOKIE_NAME}={}; Path=/; HttpOnly",
        sign_value(&config.cookie_secret, email)
    )
}

/// `Set-Cookie` value clearing the session cookie.
pub fn clear_cookie() -> String {
    format!("{COOKIE_NAME}=; Path=/; HttpOnly; Max-Age=0")
}

// ─── Signed-value codec ──────────────────────────────────────────────────────

fn mac_hex(secret: &str, payload: &str) -> String {
    // HMAC accepts keys of any length; new_from_slice on a str key cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// `b64(value)|timestamp|hex(hmac-sha256(secret, b64(value)|timestamp))`
pub fn sign_value(secret: &str, value: &str) -> String {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(value.as_bytes());
    let ts = chrono::Utc::now().timestamp();
    let payload = format!("{encoded}|{ts}");
    let mac = mac_hex(secret, &payload);
    format!("{payload}|{mac}")
}

/// Verify a signed value; returns the embedded value when the signature is
/// valid and not expired.
pub fn verify_value(secret: &str, signed: &str) -> Option<String> {
    let mut parts = signed.splitn(3, '|');
    let encoded = parts.next()?;
    let ts_str = parts.next()?;
    let mac = parts.next()?;

    let payload = format!("{encoded}|{ts_str}");
    if !constant_time_eq(&mac_hex(secret, &payload), mac) {
        return None;
    }

    let ts: i64 = ts_str.parse().ok()?;
    if chrono::Utc::now().timestamp() - ts > COOKIE_MAX_AGE_SECS {
        return None;
    }

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Pull a named cookie out of a `Cookie` header value.
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Constant-time string comparison to prevent timing-based signature oracles.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ─── Tests ───────────────────────────────────────────────────────────────────
