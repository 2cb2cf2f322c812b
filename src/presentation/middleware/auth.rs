//! Authentication Middleware
//!
//! Access-token validation for protected routes. Unlike a bare JWT decode,
//! this goes through the full validity chain: signature and expiry, then
//! the stored token row, then the bound session. A revoked session kills
//! its access tokens immediately, and a store failure reads as revoked.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::shared::error::AppError;
use crate::startup::AppState;

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    /// None only for legacy pre-session tokens.
    pub session_id: Option<Uuid>,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Authentication required".into()))
    }
}

/// Authentication middleware that validates access tokens end to end
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid authorization header format".into()))?;

    let ctx = state
        .auth
        .validate_access(token)
        .await
        .map_err(|_| AppError::Unauthorized("Invalid or revoked token".into()))?;

    // Ordinary authenticated traffic touches last_seen only; it never
    // extends the idle window.
    if let Some(session_id) = ctx.session_id {
        if let Err(e) = state.auth.touch_seen(session_id).await {
            tracing::debug!(error = %e, "Failed to touch session last_seen");
        }
    }

    request.extensions_mut().insert(AuthUser {
        username: ctx.username,
        session_id: ctx.session_id,
    });

    Ok(next.run(request).await)
}
