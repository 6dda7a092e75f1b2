//! Re-authentication page.
//!
//! Page requests that arrive without a usable access token are rewritten
//! here by the gate. The page tries a silent `POST /auth/refresh` and then
//! returns to the original location, or falls back to the login page.

use axum::{
    extract::Query,
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use url::form_urlencoded;

use crate::gate::{LOCALE_HEADER, REAUTH_RETURN_HEADER};

const NO_CACHE: &str = "no-store";

const REFRESH_ENDPOINT: &str = "/auth/refresh";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReauthQuery {
    return_to: Option<String>,
}

pub async fn reauth_page(Query(query): Query<ReauthQuery>, headers: HeaderMap) -> Response {
    // Prefer the header set by the gate on rewrite; the query is the
    // fallback for direct navigation.
    let requested = headers
        .get(REAUTH_RETURN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(query.return_to);
    let target = requested
        .filter(|t| is_safe_return_path(t))
        .unwrap_or_else(|| "/".to_string());

    let locale = headers
        .get(LOCALE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    let login = login_location(locale, &target);

    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let csp = format!(
        "default-src 'none'; script-src 'nonce-{nonce}'; connect-src 'self'; style-src 'unsafe-inline'"
    );

    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
            (header::CACHE_CONTROL, NO_CACHE.to_string()),
            (header::CONTENT_SECURITY_POLICY, csp),
        ],
        render(&target, &login, &nonce),
    )
        .into_response()
}

/// Same-origin absolute paths only. Protocol-relative (`//host`) and
/// backslash variants are treated as open redirects.
fn is_safe_return_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.chars().any(char::is_control)
}

fn login_location(locale: Option<&str>, target: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
    match locale {
        Some(locale) => format!("/{locale}/login?returnTo={encoded}"),
        None => format!("/login?returnTo={encoded}"),
    }
}

/// JSON string literal safe to embed inside a `<script>` element.
fn script_string(value: &str) -> String {
    serde_json::Value::String(value.to_owned())
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

fn render(target: &str, login: &str, nonce: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex">
<title>Signing you in</title>
</head>
<body>
<p>Signing you in&hellip;</p>
<script nonce="{nonce}">
(function () {{
  var target = {target};
  var login = {login};
  fetch({refresh}, {{ method: "POST", credentials: "same-origin" }})
    .then(function (res) {{ window.location.replace(res.ok ? target : login); }})
    .catch(function () {{ window.location.replace(login); }});
}})();
</script>
</body>
</html>
"#,
        nonce = nonce,
        target = script_string(target),
        login = script_string(login),
        refresh = script_string(REFRESH_ENDPOINT),
    )
}
