//! Tenant membership probe.
//!
//! The gate never reads the document store. It forwards the caller's cookies
//! to the portal's membership endpoint and reads back the caller's role on
//! the tenant named in their token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::COOKIE;
use serde::Deserialize;
use url::Url;

use crate::identity::Role;

/// Upper bound for one probe round trip.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Query parameter naming the tenant on the membership endpoint.
pub const TENANT_QUERY_PARAM: &str = "tenantId";

/// Membership as reported to downstream handlers via `x-membership`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Active,
    Inactive,
    /// The probe failed; the UI decides what to render
    Unknown,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Inactive => "inactive",
            MembershipStatus::Unknown => "unknown",
        }
    }
}

/// Body returned by the membership endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Membership {
    #[serde(default)]
    pub role: Option<String>,
}

impl Membership {
    pub fn status(&self) -> MembershipStatus {
        match self.role.as_deref().and_then(Role::parse) {
            Some(_) => MembershipStatus::Active,
            None => MembershipStatus::Inactive,
        }
    }
}

/// Membership probe failure ("membership probe unavailable").
#[derive(Debug)]
pub enum ProbeError {
    /// Connection failure or timeout
    Transport(String),
    /// Endpoint answered with a non-2xx status
    Status(u16),
    /// Endpoint answered 2xx with an unreadable body
    Body(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Transport(e) => write!(f, "Membership probe transport error: {}", e),
            ProbeError::Status(code) => write!(f, "Membership probe returned HTTP {}", code),
            ProbeError::Body(e) => write!(f, "Membership probe returned bad body: {}", e),
        }
    }
}

impl std::error::Error for ProbeError {}

#[async_trait]
pub trait MembershipProbe: Send + Sync {
    /// Ask whether the session in `cookie_header` is an active member of `tenant_id`.
    async fn check(
        &self,
        tenant_id: &str,
        cookie_header: Option<&str>,
    ) -> Result<Membership, ProbeError>;
}

/// Probe backed by the portal's membership endpoint.
pub struct HttpMembershipProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpMembershipProbe {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    fn url_for(&self, tenant_id: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(TENANT_QUERY_PARAM, tenant_id);
        url
    }
}

#[async_trait]
impl MembershipProbe for HttpMembershipProbe {
    async fn check(
        &self,
        tenant_id: &str,
        cookie_header: Option<&str>,
    ) -> Result<Membership, ProbeError> {
        let mut request = self.client.get(self.url_for(tenant_id));
        if let Some(cookies) = cookie_header {
            request = request.header(COOKIE, cookies);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }

        response
            .json::<Membership>()
            .await
            .map_err(|e| ProbeError::Body(e.to_string()))
    }
}
