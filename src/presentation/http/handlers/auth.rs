//! Authentication Handlers
//!
//! Login, refresh rotation, logout variants, and the explicit activity
//! ping. Refresh failures answer with the protocol's machine-readable
//! reason string and the status the client contract expects (409 only for
//! the benign rotation race).

use axum::{
    extract::State,
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::presentation::middleware::AuthUser;
use crate::shared::error::AppError;
use crate::shared::validation::validation_error;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 2, max = 64, message = "Username must be 2-64 characters"))]
    pub username: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
struct RefreshFailure {
    reason: &'static str,
    message: String,
}

fn client_meta(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string());
    (user_agent, ip_address)
}

/// Login with credentials
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    body.validate().map_err(validation_error)?;

    let (user_agent, ip_address) = client_meta(&headers);
    let creds = state
        .auth
        .login(&body.username, &body.password, user_agent, ip_address)
        .await
        .map_err(|e| match e {
            crate::application::services::AuthError::InvalidCredentials => {
                AppError::Unauthorized("Invalid username or password".into())
            }
            e => AppError::Internal(e.to_string()),
        })?;

    Ok(Json(LoginResponse {
        access_token: creds.access_token,
        refresh_token: creds.refresh_token,
        token_type: "Bearer",
        session_id: creds.session_id.to_string(),
    }))
}

/// Rotate a refresh token
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> Response {
    let (user_agent, ip_address) = client_meta(&headers);
    match state
        .auth
        .refresh(&body.refresh_token, user_agent, ip_address)
        .await
    {
        Ok(pair) => Json(TokenResponse {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer",
        })
        .into_response(),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::UNAUTHORIZED);
            (
                status,
                Json(RefreshFailure {
                    reason: e.kind(),
                    message: "Please sign in again".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Log out the calling device session
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, AppError> {
    let session_id = user
        .session_id
        .ok_or_else(|| AppError::Unauthorized("Session-bound token required".into()))?;
    state.auth.logout(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Log out every other device session
pub async fn logout_others(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, AppError> {
    let keep = user
        .session_id
        .ok_or_else(|| AppError::Unauthorized("Session-bound token required".into()))?;
    state.auth.logout_others(&user.username, keep).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Log out every session of the calling user
pub async fn logout_all(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, AppError> {
    state.auth.logout_all(&user.username).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Explicit "I am active" ping; the only call that extends the idle window.
pub async fn activity(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<StatusCode, AppError> {
    let session_id = user
        .session_id
        .ok_or_else(|| AppError::Unauthorized("Session-bound token required".into()))?;
    state.auth.touch_activity(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
