#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::Request,
    http::{HeaderName, Response},
};
use async_trait::async_trait;
use portal_gate::{
    ServerConfig, create_app,
    gate::GateSettings,
    identity::{Identity, IdentityError, IdentitySource, Role},
    jwt::JwtConfig,
    locale::LocaleResolver,
    membership::{Membership, MembershipProbe, ProbeError},
    rotation::RefreshRotationStore,
};
use serde_json::{Value, json};
use tower::ServiceExt;

pub const PRIVATE_PEM: &str = include_str!("../fixtures/ed25519_private.pem");
pub const PUBLIC_PEM: &str = include_str!("../fixtures/ed25519_public.pem");

/// Address sent in `x-forwarded-for` by tests that go through login.
pub const CLIENT_IP: &str = "203.0.113.7";

pub fn jwt() -> JwtConfig {
    JwtConfig::from_ed_pem(PRIVATE_PEM.as_bytes(), PUBLIC_PEM.as_bytes())
        .expect("Failed to load fixture keys")
}

pub fn member(subject: &str) -> Identity {
    Identity {
        subject_id: subject.to_string(),
        tenant_id: "cohen-family".to_string(),
        role: Role::Member,
        first_name: "Noa".to_string(),
        last_name: "Cohen".to_string(),
        email: format!("{}@example.com", subject),
        needs_credential_setup: false,
    }
}

pub fn setup_pending(subject: &str) -> Identity {
    Identity {
        needs_credential_setup: true,
        ..member(subject)
    }
}

/// What the fake membership endpoint does.
#[derive(Clone, Copy)]
pub enum ProbeBehavior {
    Role(Option<&'static str>),
    Fail,
    Hang,
}

pub struct FakeProbe {
    behavior: ProbeBehavior,
    calls: AtomicUsize,
    last_cookie: Mutex<Option<String>>,
}

impl FakeProbe {
    pub fn new(behavior: ProbeBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            last_cookie: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_cookie(&self) -> Option<String> {
        self.last_cookie.lock().unwrap().clone()
    }
}

#[async_trait]
impl MembershipProbe for FakeProbe {
    async fn check(
        &self,
        _tenant_id: &str,
        cookie_header: Option<&str>,
    ) -> Result<Membership, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_cookie.lock().unwrap() = cookie_header.map(str::to_owned);

        match self.behavior {
            ProbeBehavior::Role(role) => Ok(Membership {
                role: role.map(str::to_owned),
            }),
            ProbeBehavior::Fail => Err(ProbeError::Status(503)),
            ProbeBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Membership::default())
            }
        }
    }
}

/// In-memory user directory keyed by `idToken`. Tests may edit it after
/// login to simulate changes made elsewhere in the portal.
pub struct FakeIdentity {
    known: Mutex<HashMap<String, Identity>>,
    unavailable: AtomicBool,
}

impl FakeIdentity {
    pub fn new() -> Self {
        let mut known = HashMap::new();
        known.insert("good-alice".to_string(), member("alice"));
        known.insert("good-bob".to_string(), member("bob"));
        known.insert("invited-carol".to_string(), setup_pending("carol"));
        Self {
            known: Mutex::new(known),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn unavailable() -> Self {
        let identity = Self::new();
        identity.set_unavailable(true);
        identity
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Apply `change` to the subject's directory entry.
    pub fn update(&self, subject_id: &str, change: impl Fn(&mut Identity)) {
        let mut known = self.known.lock().unwrap();
        for identity in known.values_mut() {
            if identity.subject_id == subject_id {
                change(identity);
            }
        }
    }

    pub fn remove(&self, subject_id: &str) {
        self.known
            .lock()
            .unwrap()
            .retain(|_, identity| identity.subject_id != subject_id);
    }

    fn check_available(&self) -> Result<(), IdentityError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdentityError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentitySource for FakeIdentity {
    async fn verify_id_token(&self, id_token: &str) -> Result<Identity, IdentityError> {
        self.check_available()?;
        self.known
            .lock()
            .unwrap()
            .get(id_token)
            .cloned()
            .ok_or_else(|| IdentityError::Rejected("unknown token".to_string()))
    }

    async fn current_identity(
        &self,
        subject_id: &str,
        tenant_id: &str,
    ) -> Result<Identity, IdentityError> {
        self.check_available()?;
        self.known
            .lock()
            .unwrap()
            .values()
            .find(|identity| identity.subject_id == subject_id && identity.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| IdentityError::Rejected("unknown subject".to_string()))
    }
}

pub struct TestApp {
    pub router: Router,
    pub jwt: Arc<JwtConfig>,
    pub rotation: Arc<RefreshRotationStore>,
    pub probe: Arc<FakeProbe>,
    pub identity: Arc<FakeIdentity>,
}

pub struct TestAppBuilder {
    probe: ProbeBehavior,
    identity: Arc<FakeIdentity>,
    refresh_window: Duration,
    client_ip_header: Option<HeaderName>,
    downstream: Router,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        Self {
            probe: ProbeBehavior::Role(Some("member")),
            identity: Arc::new(FakeIdentity::new()),
            refresh_window: Duration::ZERO,
            client_ip_header: Some(HeaderName::from_static("x-forwarded-for")),
            downstream: echo_downstream(),
        }
    }

    pub fn probe(mut self, probe: ProbeBehavior) -> Self {
        self.probe = probe;
        self
    }

    pub fn identity(mut self, identity: FakeIdentity) -> Self {
        self.identity = Arc::new(identity);
        self
    }

    pub fn refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    pub fn client_ip_header(mut self, header: Option<HeaderName>) -> Self {
        self.client_ip_header = header;
        self
    }

    pub fn downstream(mut self, downstream: Router) -> Self {
        self.downstream = downstream;
        self
    }

    /// Configuration and downstream router, for tests that run a real server.
    pub fn into_parts(self) -> (ServerConfig, Arc<FakeProbe>, Router) {
        let probe = Arc::new(FakeProbe::new(self.probe));
        let config = ServerConfig {
            jwt: Arc::new(jwt()),
            secure_cookies: false,
            locales: LocaleResolver::new(["en", "he"], "en").unwrap(),
            gate: GateSettings {
                probe_timeout: Duration::from_millis(200),
                ..GateSettings::default()
            },
            refresh_rate_limit: self.refresh_window,
            membership_probe: probe.clone(),
            identity_source: self.identity,
            client_ip_header: self.client_ip_header,
        };
        (config, probe, self.downstream)
    }

    pub fn build(self) -> TestApp {
        let identity = self.identity.clone();
        let (config, probe, downstream) = self.into_parts();
        let rotation = config.rotation_store();
        let router = create_app(&config, rotation.clone(), downstream);

        TestApp {
            router,
            jwt: config.jwt.clone(),
            rotation,
            probe,
            identity,
        }
    }
}

impl TestApp {
    pub async fn send(&self, request: axum::http::Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Downstream handler that reports what the gate forwarded.
pub fn echo_downstream() -> Router {
    Router::new().fallback(echo)
}

async fn echo(request: Request) -> Json<Value> {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    Json(json!({
        "path": request.uri().path(),
        "query": request.uri().query(),
        "locale": header("x-locale"),
        "membership": header("x-membership"),
        "subject": header("x-subject-id"),
        "tenant": header("x-tenant-id"),
    }))
}

/// `Cookie` header carrying an access token for `identity`.
pub fn access_cookie_for(jwt: &JwtConfig, identity: &Identity, ttl: i64) -> String {
    format!(
        "access_token={}",
        jwt.sign_access(identity, ttl).unwrap().token
    )
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

/// Value of cookie `name` among `Set-Cookie` lines.
pub fn cookie_value(set_cookies: &[String], name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    set_cookies
        .iter()
        .find(|c| c.starts_with(&prefix))
        .and_then(|c| c[prefix.len()..].split(';').next())
        .map(str::to_owned)
}
