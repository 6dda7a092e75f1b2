//! Identity claims and the login-time identity source.
//!
//! The portal's user directory is an external collaborator. At login the
//! gate exchanges the externally issued `idToken` for the authoritative
//! [`Identity`], which is then stamped into access and refresh tokens. On
//! every refresh the identity is read again by subject, so role and
//! credential-setup changes reach the next token pair.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// Role of a subject within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Parse a role name; anything else (pending, invited, revoked...) is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Role::Member),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Tenant-scoped identity carried by every token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Subject (user id)
    #[serde(rename = "sub")]
    pub subject_id: String,
    pub tenant_id: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Set while the account still has to choose its own credentials
    /// (e.g. right after accepting an invitation).
    #[serde(default)]
    pub needs_credential_setup: bool,
}

/// Errors from exchanging an `idToken` for an identity.
#[derive(Debug)]
pub enum IdentityError {
    /// The identity source refused the credential
    Rejected(String),
    /// The identity source could not be reached or answered garbage
    Unavailable(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Rejected(msg) => write!(f, "Identity rejected: {}", msg),
            IdentityError::Unavailable(msg) => write!(f, "Identity source unavailable: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

/// The portal's user directory, as seen by the session endpoints.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Exchange an externally issued credential for the identity it names.
    async fn verify_id_token(&self, id_token: &str) -> Result<Identity, IdentityError>;

    /// Current identity of an already signed-in subject. `Rejected` means the
    /// subject no longer belongs to the tenant.
    async fn current_identity(
        &self,
        subject_id: &str,
        tenant_id: &str,
    ) -> Result<Identity, IdentityError>;
}

/// Identity source backed by the portal's user directory endpoints.
///
/// Verification POSTs `{ "idToken": ... }` to `verify_url`; lookups GET
/// `lookup_url?subjectId=..&tenantId=..`. Both expect an [`Identity`] JSON
/// body.
pub struct HttpIdentitySource {
    client: reqwest::Client,
    verify_url: Url,
    lookup_url: Url,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    id_token: &'a str,
}

impl HttpIdentitySource {
    pub fn new(verify_url: Url, lookup_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, verify_url, lookup_url))
    }

    pub fn with_client(client: reqwest::Client, verify_url: Url, lookup_url: Url) -> Self {
        Self {
            client,
            verify_url,
            lookup_url,
        }
    }

    fn lookup_url_for(&self, subject_id: &str, tenant_id: &str) -> Url {
        let mut url = self.lookup_url.clone();
        url.query_pairs_mut()
            .append_pair("subjectId", subject_id)
            .append_pair("tenantId", tenant_id);
        url
    }
}

#[async_trait]
impl IdentitySource for HttpIdentitySource {
    async fn verify_id_token(&self, id_token: &str) -> Result<Identity, IdentityError> {
        let result = self
            .client
            .post(self.verify_url.clone())
            .json(&VerifyRequest { id_token })
            .send()
            .await;
        read_identity(result).await
    }

    async fn current_identity(
        &self,
        subject_id: &str,
        tenant_id: &str,
    ) -> Result<Identity, IdentityError> {
        let result = self
            .client
            .get(self.lookup_url_for(subject_id, tenant_id))
            .send()
            .await;
        let identity = read_identity(result).await?;

        if identity.subject_id != subject_id || identity.tenant_id != tenant_id {
            return Err(IdentityError::Rejected(format!(
                "directory answered for {}/{}",
                identity.tenant_id, identity.subject_id
            )));
        }
        Ok(identity)
    }
}

/// 4xx is a rejection; transport failures, other statuses and bad bodies
/// mean the directory is unavailable.
async fn read_identity(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<Identity, IdentityError> {
    let response = result.map_err(|e| IdentityError::Unavailable(e.to_string()))?;

    let status = response.status();
    if status.is_client_error() {
        return Err(IdentityError::Rejected(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(IdentityError::Unavailable(format!("HTTP {}", status)));
    }

    response
        .json::<Identity>()
        .await
        .map_err(|e| IdentityError::Unavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_wire_format() {
        let json = r#"{
            "sub": "u-1",
            "tenantId": "t-1",
            "role": "admin",
            "firstName": "Dana",
            "lastName": "Levi",
            "email": "dana@example.com"
        }"#;

        let identity: Identity = serde_json::from_str(json).unwrap();
        assert_eq!(identity.subject_id, "u-1");
        assert_eq!(identity.tenant_id, "t-1");
        assert_eq!(identity.role, Role::Admin);
        assert!(!identity.needs_credential_setup);
    }

    #[test]
    fn test_lookup_url_encodes_ids() {
        let source = HttpIdentitySource::new(
            Url::parse("http://directory.internal/api/identity/verify").unwrap(),
            Url::parse("http://directory.internal/api/identity/current").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();

        assert_eq!(
            source.lookup_url_for("u 1", "levi&family").as_str(),
            "http://directory.internal/api/identity/current?subjectId=u+1&tenantId=levi%26family"
        );
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("member"), Some(Role::Member));
        assert_eq!(Role::parse("admin"), Some(Role::Admin));
        assert_eq!(Role::parse("pending"), None);
        assert_eq!(Role::parse(""), None);
    }
}
