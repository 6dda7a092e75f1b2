//! Forwarding of gated requests to the portal origin.
//!
//! Requests that the gate lets through (possibly rewritten, with the gate
//! headers attached) are replayed against the upstream origin and the
//! response is relayed verbatim, minus hop-by-hop headers.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};
use url::Url;

use crate::api::ApiError;

/// Largest request body forwarded upstream.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct UpstreamProxy {
    client: reqwest::Client,
    origin: Url,
}

impl UpstreamProxy {
    pub fn new(origin: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, origin })
    }

    /// Router forwarding every request it receives.
    pub fn router(self) -> Router {
        Router::new().fallback(forward).with_state(self)
    }

    /// Upstream URL for an inbound URI. Only path and query are taken from
    /// the request, so the origin's scheme and authority cannot be altered.
    ///
    /// `None` when URL parsing would change the path (dot segments,
    /// backslashes): upstream must see exactly the path the gate classified.
    fn target(&self, uri: &Uri) -> Option<Url> {
        let mut url = self.origin.clone();
        url.set_path(uri.path());
        if url.path() != uri.path() {
            return None;
        }
        url.set_query(uri.query());
        Some(url)
    }
}

async fn forward(State(proxy): State<UpstreamProxy>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "Rejected request body");
            return ApiError::payload_too_large("Request body too large").into_response();
        }
    };

    let mut headers = parts.headers;
    let original_host = headers.remove(header::HOST);
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);
    if let Some(host) = original_host {
        headers.insert(FORWARDED_HOST, host);
    }

    let Some(url) = proxy.target(&parts.uri) else {
        warn!(path = %parts.uri.path(), "Refusing to forward path that would be normalised");
        return ApiError::bad_request("Bad request").into_response();
    };
    let result = proxy
        .client
        .request(parts.method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match result {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %url, error = %e, "Upstream request failed");
            return ApiError::bad_gateway("Bad gateway").into_response();
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    match upstream.bytes().await {
        Ok(bytes) => (status, headers, Body::from(bytes)).into_response(),
        Err(e) => {
            warn!(url = %url, error = %e, "Failed to read upstream response");
            ApiError::bad_gateway("Bad gateway").into_response()
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
