//! Session cookie parsing and `Set-Cookie` construction.
//!
//! The refresh cookie is scoped to the refresh endpoint so browsers never
//! attach it to ordinary page or API traffic. Clearing must repeat the exact
//! path a cookie was set with, otherwise the browser keeps it.

use axum::http::{HeaderMap, HeaderName, header};
use axum::response::AppendHeaders;

use crate::jwt::SignedToken;

/// Cookie name for the access token (short-lived).
pub const ACCESS_COOKIE_NAME: &str = "access_token";

/// Cookie name for the refresh token (long-lived).
pub const REFRESH_COOKIE_NAME: &str = "refresh_token";

/// Path of the access cookie.
pub const ACCESS_COOKIE_PATH: &str = "/";

/// Path of the refresh cookie; only the refresh endpoint ever sees it.
pub const REFRESH_COOKIE_PATH: &str = "/auth/refresh";

/// Headers that set or clear session cookies on a response.
pub type SetCookies = AppendHeaders<Vec<(HeaderName, String)>>;

/// Extract a cookie value from the Cookie header.
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(cookie_header) = value.to_str() else {
            continue;
        };
        for part in cookie_header.split(';') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                if key.trim() == name {
                    return Some(value.trim());
                }
            }
        }
    }
    None
}

fn cookie(name: &str, value: &str, path: &str, max_age: i64, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path={}; Max-Age={}{}",
        name,
        value,
        path,
        max_age.max(0),
        secure
    )
}

pub fn access_cookie(access: &SignedToken, secure: bool) -> String {
    cookie(
        ACCESS_COOKIE_NAME,
        &access.token,
        ACCESS_COOKIE_PATH,
        access.ttl,
        secure,
    )
}

pub fn refresh_cookie(refresh: &SignedToken, secure: bool) -> String {
    cookie(
        REFRESH_COOKIE_NAME,
        &refresh.token,
        REFRESH_COOKIE_PATH,
        refresh.ttl,
        secure,
    )
}

/// Set the access cookie and, when given, the refresh cookie.
pub fn session_cookies(
    access: &SignedToken,
    refresh: Option<&SignedToken>,
    secure: bool,
) -> SetCookies {
    let mut cookies = vec![(header::SET_COOKIE, access_cookie(access, secure))];
    if let Some(refresh) = refresh {
        cookies.push((header::SET_COOKIE, refresh_cookie(refresh, secure)));
    }
    AppendHeaders(cookies)
}

/// Expire both session cookies on the paths they were set with.
pub fn clear_session_cookies(secure: bool) -> SetCookies {
    AppendHeaders(vec![
        (
            header::SET_COOKIE,
            cookie(ACCESS_COOKIE_NAME, "", ACCESS_COOKIE_PATH, 0, secure),
        ),
        (
            header::SET_COOKIE,
            cookie(REFRESH_COOKIE_NAME, "", REFRESH_COOKIE_PATH, 0, secure),
        ),
    ])
}
