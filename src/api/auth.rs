use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use crate::db::{ChangePasswordRequest, LoginRequest, LoginResponse};
use crate::AppState;

pub const SESSION_COOKIE: &str = "session";
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Create the operator password on first run. Returns the generated
/// plaintext so the caller can show it once.
pub async fn ensure_password(path: &Path) -> anyhow::Result<Option<String>> {
    if tokio::fs::try_exists(path).await? {
        return Ok(None);
    }

    let bytes: [u8; 8] = rand::rng().random();
    let password = hex::encode(bytes);
    let hash = hash_password(&password)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, hash).await?;
    Ok(Some(password))
}

async fn stored_hash(state: &AppState) -> Result<String, ApiError> {
    let path = state.config.password_path();
    tokio::fs::read_to_string(&path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            tracing::error!("Failed to read {}: {}", path.display(), e);
            ApiError::internal("Password store unavailable")
        })
}

/// Session token from the cookie, then a bearer header, then `?token=`
/// (browsers cannot set headers on WebSocket upgrades).
fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    if let Some(header) = headers.get("Authorization").and_then(|h| h.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    query.and_then(|q| {
        q.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    })
}

async fn is_authenticated(state: &AppState, token: &str) -> Result<bool, ApiError> {
    let token_hash = hash_token(token);
    let session = state.sessions.find_valid(&token_hash).await?;
    Ok(session.is_some_and(|s| bool::from(s.token_hash.as_bytes().ct_eq(token_hash.as_bytes()))))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let hash = stored_hash(&state).await?;
    if !verify_password(&request.password, &hash) {
        tracing::warn!("Rejected login with wrong password");
        return Err(ApiError::unauthorized("Invalid password"));
    }

    let token = generate_token();
    let ttl = chrono::Duration::hours(state.config.auth.session_ttl_hours);
    let session = state.sessions.create(&hash_token(&token), ttl).await?;

    let cookie = Cookie::build((SESSION_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);

    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            token,
            expires_at: session.expires_at,
        }),
    ))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, StatusCode), ApiError> {
    if let Some(token) = extract_token(&headers, None) {
        state.sessions.delete(&hash_token(&token)).await?;
    }
    Ok((
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        StatusCode::NO_CONTENT,
    ))
}

pub async fn check(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Result<Json<AuthStatus>, ApiError> {
    let authenticated = match extract_token(request.headers(), request.uri().query()) {
        Some(token) => is_authenticated(&state, &token).await?,
        None => false,
    };
    Ok(Json(AuthStatus { authenticated }))
}

/// Replace the operator password and end every session.
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<(CookieJar, StatusCode), ApiError> {
    if !verify_password(&request.current_password, &stored_hash(&state).await?) {
        return Err(ApiError::unauthorized("Current password is incorrect"));
    }
    if request.new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation_field(
            "newPassword",
            format!("Password must be at least {} characters", MIN_PASSWORD_LEN),
        ));
    }

    let hash = hash_password(&request.new_password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;
    tokio::fs::write(state.config.password_path(), hash)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to store password: {}", e)))?;
    state.sessions.delete_all().await?;

    tracing::info!("Operator password changed, all sessions revoked");
    Ok((
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        StatusCode::NO_CONTENT,
    ))
}

/// Auth middleware that validates session tokens
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers(), request.uri().query())
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    if !is_authenticated(&state, &token).await? {
        return Err(ApiError::unauthorized("Session expired or invalid"));
    }
    Ok(next.run(request).await)
}
