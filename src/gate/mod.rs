//! Per-request edge gate.
//!
//! [`RequestGate::decide`] is a pure function of the request (plus the
//! membership probe) that yields exactly one [`GateDecision`]. The HTTP glue
//! in [`middleware`] applies the decision to the request or response.

pub mod middleware;
mod routes;

pub use middleware::{
    LOCALE_HEADER, MEMBERSHIP_HEADER, REAUTH_RETURN_HEADER, SUBJECT_HEADER, TENANT_HEADER,
    gate_middleware,
};
pub use routes::{RouteKind, RouteTable};

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::auth::{ACCESS_COOKIE_NAME, get_cookie};
use crate::identity::Identity;
use crate::jwt::JwtConfig;
use crate::locale::{LocaleResolver, ResolvedLocale};
use crate::membership::{DEFAULT_PROBE_TIMEOUT, MembershipProbe, MembershipStatus};

/// Paths and limits the gate works with.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub routes: RouteTable,
    /// Paths under this prefix get JSON rejections instead of page flows
    pub api_prefix: String,
    /// Internal page that silently refreshes the session
    pub reauth_path: String,
    /// Where signed-in users land when they open the login page
    pub home_path: String,
    pub credential_setup_path: String,
    /// Hard bound on a membership probe, whatever the probe implementation
    pub probe_timeout: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            routes: RouteTable::portal(),
            api_prefix: "/api".to_string(),
            reauth_path: "/reauth".to_string(),
            home_path: "/home".to_string(),
            credential_setup_path: "/setup-credentials".to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl GateSettings {
    fn is_api(&self, path: &str) -> bool {
        let prefix = self.api_prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// The one thing the gate does with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Pass through to the application.
    Continue {
        locale: String,
        identity: Option<Identity>,
        membership: Option<MembershipStatus>,
    },
    /// Answer with a redirect.
    Redirect { location: String, status: StatusCode },
    /// Serve a different internal path, adding headers to the request.
    Rewrite {
        path_and_query: String,
        headers: Vec<(HeaderName, HeaderValue)>,
    },
    /// Answer with a JSON error.
    Reject {
        status: StatusCode,
        body: serde_json::Value,
    },
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Continue { .. } => "continue",
            GateDecision::Redirect { .. } => "redirect",
            GateDecision::Rewrite { .. } => "rewrite",
            GateDecision::Reject { .. } => "reject",
        }
    }
}

/// The parts of an inbound request the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

pub struct RequestGate {
    settings: GateSettings,
    locales: LocaleResolver,
    jwt: Arc<JwtConfig>,
    probe: Arc<dyn MembershipProbe>,
}

impl RequestGate {
    pub fn new(
        settings: GateSettings,
        locales: LocaleResolver,
        jwt: Arc<JwtConfig>,
        probe: Arc<dyn MembershipProbe>,
    ) -> Self {
        Self {
            settings,
            locales,
            jwt,
            probe,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub async fn decide(&self, req: GateRequest<'_>) -> GateDecision {
        // Downstream URL handling may resolve dot segments; classify only
        // paths that cannot be rewritten after the fact.
        if !is_canonical_path(req.path) {
            debug!(path = %req.path, "Rejected non-canonical path");
            return GateDecision::Reject {
                status: StatusCode::BAD_REQUEST,
                body: json!({ "error": "Bad request" }),
            };
        }

        let accept_language = req
            .headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|v| v.to_str().ok());
        let locale = self.locales.resolve(req.path, req.query, accept_language);
        let path = locale.stripped_path.as_str();
        let kind = self.settings.routes.classify(path);

        if kind == RouteKind::LocalizedPublic && !locale.path_prefixed {
            return GateDecision::Redirect {
                location: localized(&locale.tag, path, req.query),
                status: StatusCode::PERMANENT_REDIRECT,
            };
        }

        if matches!(kind, RouteKind::Public | RouteKind::LocalizedPublic) {
            return continue_anonymous(&locale);
        }

        let is_api = self.settings.is_api(path);

        let Some(identity) = self.authenticate(req.headers, path) else {
            if kind == RouteKind::LoginPage {
                return continue_anonymous(&locale);
            }
            return self.unauthenticated(is_api, &locale, req);
        };

        if identity.needs_credential_setup {
            if is_api && kind != RouteKind::SetupExemptApi {
                return GateDecision::Reject {
                    status: StatusCode::FORBIDDEN,
                    body: json!({ "error": "Credential setup required" }),
                };
            }
            if !is_api
                && !matches!(
                    kind,
                    RouteKind::CredentialSetupPage | RouteKind::Invitation | RouteKind::LoginPage
                )
            {
                return GateDecision::Redirect {
                    location: localized(&locale.tag, &self.settings.credential_setup_path, None),
                    status: StatusCode::TEMPORARY_REDIRECT,
                };
            }
        }

        if kind == RouteKind::LoginPage {
            let target = if identity.needs_credential_setup {
                &self.settings.credential_setup_path
            } else {
                &self.settings.home_path
            };
            return GateDecision::Redirect {
                location: localized(&locale.tag, target, None),
                status: StatusCode::TEMPORARY_REDIRECT,
            };
        }

        // The membership endpoint is what the probe calls; don't probe the probe.
        let membership = if kind == RouteKind::MembershipApi {
            None
        } else {
            Some(self.probe_membership(&identity, req.headers).await)
        };

        GateDecision::Continue {
            locale: locale.tag,
            identity: Some(identity),
            membership,
        }
    }

    /// Verify the access cookie. Every failure looks the same to the caller.
    fn authenticate(&self, headers: &HeaderMap, path: &str) -> Option<Identity> {
        let token = get_cookie(headers, ACCESS_COOKIE_NAME)?;
        match self.jwt.verify_access(token) {
            Ok(claims) => Some(claims.identity),
            Err(e) => {
                debug!(path = %path, error = %e, "Access token rejected");
                None
            }
        }
    }

    fn unauthenticated(
        &self,
        is_api: bool,
        locale: &ResolvedLocale,
        req: GateRequest<'_>,
    ) -> GateDecision {
        if is_api {
            return GateDecision::Reject {
                status: StatusCode::UNAUTHORIZED,
                body: json!({ "error": "Unauthorized" }),
            };
        }

        let original = match req.query {
            Some(q) if !q.is_empty() => format!("{}?{}", req.path, q),
            _ => req.path.to_string(),
        };
        let encoded: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();

        let reauth = format!("{}?returnTo={}", self.settings.reauth_path, encoded);

        // The re-auth page only answers GET; other methods are sent there
        // as a fresh GET.
        if req.method != Method::GET && req.method != Method::HEAD {
            return GateDecision::Redirect {
                location: reauth,
                status: StatusCode::SEE_OTHER,
            };
        }

        let mut headers = Vec::new();
        if let Ok(value) = HeaderValue::from_str(&original) {
            headers.push((HeaderName::from_static(REAUTH_RETURN_HEADER), value));
        }
        if let Ok(value) = HeaderValue::from_str(&locale.tag) {
            headers.push((HeaderName::from_static(LOCALE_HEADER), value));
        }

        GateDecision::Rewrite {
            path_and_query: reauth,
            headers,
        }
    }

    /// Ask the membership endpoint about the caller. Never blocks the request.
    async fn probe_membership(&self, identity: &Identity, headers: &HeaderMap) -> MembershipStatus {
        let cookies = forwarded_cookies(headers);
        let check = self.probe.check(&identity.tenant_id, cookies.as_deref());

        match tokio::time::timeout(self.settings.probe_timeout, check).await {
            Ok(Ok(membership)) => {
                let status = membership.status();
                if status != MembershipStatus::Active {
                    info!(
                        subject = %identity.subject_id,
                        tenant = %identity.tenant_id,
                        role = ?membership.role,
                        "Subject is not an active member, continuing"
                    );
                }
                status
            }
            Ok(Err(e)) => {
                warn!(
                    subject = %identity.subject_id,
                    tenant = %identity.tenant_id,
                    error = %e,
                    "Membership probe unavailable, continuing"
                );
                MembershipStatus::Unknown
            }
            Err(_) => {
                warn!(
                    subject = %identity.subject_id,
                    tenant = %identity.tenant_id,
                    timeout_ms = self.settings.probe_timeout.as_millis() as u64,
                    "Membership probe timed out, continuing"
                );
                MembershipStatus::Unknown
            }
        }
    }
}

/// Absolute path free of empty, `.` and `..` segments (percent-encoded
/// dots included). A single trailing slash is allowed.
fn is_canonical_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.contains('\\') {
        return false;
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let last = segments.len() - 1;
    segments.iter().enumerate().all(|(i, segment)| {
        if segment.is_empty() {
            return i == last;
        }
        !is_dot_segment(segment)
    })
}

fn is_dot_segment(segment: &str) -> bool {
    let lowered = segment.to_ascii_lowercase();
    matches!(
        lowered.as_str(),
        "." | ".." | "%2e" | ".%2e" | "%2e." | "%2e%2e"
    )
}

fn continue_anonymous(locale: &ResolvedLocale) -> GateDecision {
    GateDecision::Continue {
        locale: locale.tag.clone(),
        identity: None,
        membership: None,
    }
}

/// `/he` + `/blog` + `?q` -> `/he/blog?q`; the root maps to `/he`.
fn localized(tag: &str, path: &str, query: Option<&str>) -> String {
    let mut location = if path == "/" {
        format!("/{}", tag)
    } else {
        format!("/{}{}", tag, path)
    };
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        location.push('?');
        location.push_str(q);
    }
    location
}

fn forwarded_cookies(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}
