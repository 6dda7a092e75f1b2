//! Session endpoints.
//!
//! - POST `/login` - Exchange an external `idToken` for a session
//! - POST `/refresh` - Rotate the refresh token, mint a new access token
//! - POST `/logout` - Revoke the rotation chain and clear both cookies

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::{ApiError, ResultExt};
use crate::auth::{
    ACCESS_COOKIE_NAME, REFRESH_COOKIE_NAME, clear_session_cookies, get_cookie, session_cookies,
};
use crate::identity::{IdentityError, IdentitySource};
use crate::jwt::JwtConfig;
use crate::rate_limit::{LoginRateLimit, rate_limit_login};
use crate::rotation::{RefreshRotationStore, RotationError};

#[derive(Clone)]
pub struct SessionState {
    pub jwt: Arc<JwtConfig>,
    pub rotation: Arc<RefreshRotationStore>,
    pub identity: Arc<dyn IdentitySource>,
    pub secure_cookies: bool,
}

pub fn router(state: SessionState, login_limit: LoginRateLimit) -> Router {
    Router::new()
        .route(
            "/login",
            post(login).layer(middleware::from_fn_with_state(
                login_limit,
                rate_limit_login,
            )),
        )
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    id_token: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
}

/// Verify the external credential and start a new rotation chain.
async fn login(
    State(state): State<SessionState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload.map_err(|e| {
        debug!(error = %e, "Rejected login body");
        ApiError::unauthorized("Invalid credentials")
    })?;

    if payload.id_token.trim().is_empty() {
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    let identity = state
        .identity
        .verify_id_token(&payload.id_token)
        .await
        .map_err(|e| match e {
            IdentityError::Rejected(_) => {
                info!(error = %e, "Login rejected");
                ApiError::unauthorized("Invalid credentials")
            }
            IdentityError::Unavailable(_) => {
                warn!(error = %e, "Identity source unavailable");
                ApiError::service_unavailable("Identity service unavailable")
            }
        })?;

    let access = state
        .jwt
        .sign_access(&identity, state.jwt.access_ttl())
        .internal_err("Failed to sign access token")?;
    let refresh = state
        .rotation
        .issue(&identity)
        .internal_err("Failed to sign refresh token")?;

    info!(
        subject = %identity.subject_id,
        tenant = %identity.tenant_id,
        "Login succeeded"
    );

    Ok((
        StatusCode::OK,
        session_cookies(&access, Some(&refresh.signed), state.secure_cookies),
        Json(LoginResponse {
            token: access.token.clone(),
        }),
    ))
}

/// Exchange the refresh cookie for a fresh access/refresh pair.
///
/// The new pair carries the directory's current identity, so role and
/// credential-setup changes take effect without a new login.
async fn refresh(State(state): State<SessionState>, headers: HeaderMap) -> Response {
    let Some(presented) = get_cookie(&headers, REFRESH_COOKIE_NAME) else {
        return unauthorized_and_clear(state.secure_cookies);
    };

    let claims = match state.rotation.verify(presented) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "Refresh rejected");
            return unauthorized_and_clear(state.secure_cookies);
        }
    };
    let subject = &claims.identity.subject_id;

    let identity = match state
        .identity
        .current_identity(subject, &claims.identity.tenant_id)
        .await
    {
        Ok(identity) => identity,
        Err(e @ IdentityError::Rejected(_)) => {
            let revoked = state.rotation.revoke(subject);
            info!(subject = %subject, revoked, error = %e, "Directory no longer knows subject");
            return unauthorized_and_clear(state.secure_cookies);
        }
        Err(e @ IdentityError::Unavailable(_)) => {
            warn!(subject = %subject, error = %e, "Identity source unavailable during refresh");
            return ApiError::service_unavailable("Identity service unavailable").into_response();
        }
    };

    match state.rotation.rotate_with(presented, &claims, identity) {
        Ok(rotated) => (
            StatusCode::OK,
            session_cookies(
                &rotated.access,
                Some(&rotated.refresh.signed),
                state.secure_cookies,
            ),
            Json(json!({ "ok": true })),
        )
            .into_response(),
        Err(RotationError::RateLimited) => {
            ApiError::too_many_requests("Too many refresh attempts").into_response()
        }
        Err(RotationError::Signing(e)) => {
            error!(error = %e, "Failed to sign rotated tokens");
            ApiError::internal("Failed to refresh session").into_response()
        }
        Err(e) => {
            debug!(error = %e, "Refresh rejected");
            unauthorized_and_clear(state.secure_cookies)
        }
    }
}

/// Logout - revoke the caller's rotation chain and clear both cookies.
/// Always succeeds so a broken session can still sign out.
async fn logout(State(state): State<SessionState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = get_cookie(&headers, ACCESS_COOKIE_NAME) {
        if let Ok(claims) = state.jwt.verify_access(token) {
            let revoked = state.rotation.revoke(&claims.identity.subject_id);
            info!(subject = %claims.identity.subject_id, revoked, "Logged out");
        }
    }

    (
        StatusCode::OK,
        clear_session_cookies(state.secure_cookies),
        Json(json!({ "ok": true })),
    )
}

fn unauthorized_and_clear(secure_cookies: bool) -> Response {
    (
        clear_session_cookies(secure_cookies),
        ApiError::unauthorized("Unauthorized"),
    )
        .into_response()
}
