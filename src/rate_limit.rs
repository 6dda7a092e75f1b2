//! Per-IP rate limiting for the login endpoint.
//!
//! Uses a keyed GCRA limiter so one client cannot brute force `idToken`
//! exchanges. Refresh traffic is limited per subject by the rotation store.

use axum::{
    extract::{Request, State},
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::{num::NonZeroU32, sync::Arc};
use tracing::debug;

use crate::api::ApiError;
use crate::auth::extract_client_ip;

/// Per-IP rate limiter.
pub type IpLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Sustained login attempts per second per IP.
pub const LOGIN_PER_SEC: u32 = 1;

/// Login attempts a single IP may burst before throttling.
pub const LOGIN_BURST: u32 = 5;

#[derive(Clone)]
pub struct LoginRateLimit {
    limiter: Arc<IpLimiter>,
    ip_header: Option<HeaderName>,
}

impl LoginRateLimit {
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32, ip_header: Option<HeaderName>) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::keyed(
                Quota::per_second(per_second).allow_burst(burst),
            )),
            ip_header,
        }
    }

    /// Limiter with the default login quota.
    pub fn with_defaults(ip_header: Option<HeaderName>) -> Self {
        const PER_SEC: NonZeroU32 = NonZeroU32::new(LOGIN_PER_SEC).unwrap();
        const BURST: NonZeroU32 = NonZeroU32::new(LOGIN_BURST).unwrap();
        Self::new(PER_SEC, BURST, ip_header)
    }
}

/// Middleware for rate limiting login attempts.
pub async fn rate_limit_login(
    State(config): State<LoginRateLimit>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, config.ip_header.as_ref()) {
        Ok(ip) => ip,
        Err(reason) => {
            debug!(reason, "Cannot rate limit login without a client IP");
            return ApiError::forbidden("Unable to determine client IP.").into_response();
        }
    };

    match config.limiter.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(_) => {
            debug!(ip = %ip, "Login rate limited");
            ApiError::too_many_requests("Too many login attempts. Please wait before trying again.")
                .into_response()
        }
    }
}
