mod error;
mod reauth;
mod session;

use axum::{Router, routing::get};
use std::sync::Arc;

use crate::identity::IdentitySource;
use crate::jwt::JwtConfig;
use crate::rate_limit::LoginRateLimit;
use crate::rotation::RefreshRotationStore;

pub use error::{ApiError, ResultExt};
pub use reauth::reauth_page;
pub use session::SessionState;

/// Create the session router, nested under `/auth`.
pub fn create_auth_router(
    jwt: Arc<JwtConfig>,
    rotation: Arc<RefreshRotationStore>,
    identity: Arc<dyn IdentitySource>,
    secure_cookies: bool,
    login_limit: LoginRateLimit,
) -> Router {
    let session_state = session::SessionState {
        jwt,
        rotation,
        identity,
        secure_cookies,
    };

    session::router(session_state, login_limit)
}

/// Router serving the re-authentication page at `path`.
pub fn create_reauth_router(path: &str) -> Router {
    Router::new().route(path, get(reauth_page))
}
