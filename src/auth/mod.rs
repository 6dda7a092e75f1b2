//! Session cookies and client identification.
//!
//! The access token lives in a cookie scoped to `/`; the refresh token is
//! scoped to the refresh endpoint so it never travels with page or API
//! requests.

mod cookie;
mod ip;

pub use cookie::{
    ACCESS_COOKIE_NAME, ACCESS_COOKIE_PATH, REFRESH_COOKIE_NAME, REFRESH_COOKIE_PATH, SetCookies,
    access_cookie, clear_session_cookies, get_cookie, refresh_cookie, session_cookies,
};
pub use ip::extract_client_ip;
