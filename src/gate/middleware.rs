//! Axum middleware applying [`GateDecision`]s.
//!
//! The middleware must wrap the whole router (not individual routes) so a
//! rewritten URI is routed afresh; see `create_app`.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Uri, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use super::{GateDecision, GateRequest, RequestGate};
use crate::api::ApiError;

/// Resolved locale for downstream rendering.
pub const LOCALE_HEADER: &str = "x-locale";

/// `active`, `inactive` or `unknown`.
pub const MEMBERSHIP_HEADER: &str = "x-membership";

/// Verified subject of the access token.
pub const SUBJECT_HEADER: &str = "x-subject-id";

/// Verified tenant of the access token.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Original path and query of a request rewritten to the re-auth page.
pub const REAUTH_RETURN_HEADER: &str = "x-reauth-return-to";

/// Headers only the gate may set; inbound copies are dropped.
const GATE_HEADERS: [&str; 5] = [
    LOCALE_HEADER,
    MEMBERSHIP_HEADER,
    SUBJECT_HEADER,
    TENANT_HEADER,
    REAUTH_RETURN_HEADER,
];

pub async fn gate_middleware(
    State(gate): State<Arc<RequestGate>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    for name in GATE_HEADERS {
        parts.headers.remove(name);
    }

    let decision = gate
        .decide(GateRequest {
            method: &parts.method,
            path: parts.uri.path(),
            query: parts.uri.query(),
            headers: &parts.headers,
        })
        .await;

    debug!(
        method = %parts.method,
        path = %parts.uri.path(),
        decision = decision.label(),
        "Gate decision"
    );

    match decision {
        GateDecision::Continue {
            locale,
            identity,
            membership,
        } => {
            insert_header(&mut parts.headers, LOCALE_HEADER, &locale);
            if let Some(membership) = membership {
                insert_header(&mut parts.headers, MEMBERSHIP_HEADER, membership.as_str());
            }
            if let Some(identity) = identity {
                insert_header(&mut parts.headers, SUBJECT_HEADER, &identity.subject_id);
                insert_header(&mut parts.headers, TENANT_HEADER, &identity.tenant_id);
            }
            next.run(Request::from_parts(parts, body)).await
        }
        GateDecision::Redirect { location, status } => {
            match HeaderValue::from_str(&location) {
                Ok(location) => (status, [(header::LOCATION, location)]).into_response(),
                Err(e) => {
                    error!(location = %location, error = %e, "Unencodable redirect target");
                    ApiError::internal("Invalid redirect").into_response()
                }
            }
        }
        GateDecision::Rewrite {
            path_and_query,
            headers,
        } => {
            match path_and_query.parse::<Uri>() {
                Ok(uri) => parts.uri = uri,
                Err(e) => {
                    error!(target = %path_and_query, error = %e, "Unparseable rewrite target");
                    return ApiError::internal("Invalid rewrite").into_response();
                }
            }
            for (name, value) in headers {
                parts.headers.insert(name, value);
            }
            next.run(Request::from_parts(parts, body)).await
        }
        GateDecision::Reject { status, body } => (status, Json(body)).into_response(),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => debug!(header = name, "Skipping header with unencodable value"),
    }
}
