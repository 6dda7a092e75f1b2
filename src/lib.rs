pub mod api;
pub mod auth;
pub mod cleanup;
pub mod cli;
pub mod gate;
pub mod identity;
pub mod jwt;
pub mod locale;
pub mod membership;
pub mod rate_limit;
pub mod rotation;
pub mod upstream;

use api::{create_auth_router, create_reauth_router};
use axum::{Router, http::HeaderName, middleware};
use gate::{GateSettings, RequestGate, gate_middleware};
use identity::IdentitySource;
use jwt::JwtConfig;
use locale::LocaleResolver;
use membership::MembershipProbe;
use rate_limit::LoginRateLimit;
use rotation::RefreshRotationStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::Layer;

pub struct ServerConfig {
    /// Signing and verification keys plus token lifetimes
    pub jwt: Arc<JwtConfig>,
    /// Whether to set Secure flag on cookies (should be true in production with HTTPS)
    pub secure_cookies: bool,
    /// Supported locales and the default
    pub locales: LocaleResolver,
    /// Route table and gate paths
    pub gate: GateSettings,
    /// Minimum spacing between refreshes of one subject
    pub refresh_rate_limit: Duration,
    pub membership_probe: Arc<dyn MembershipProbe>,
    pub identity_source: Arc<dyn IdentitySource>,
    /// Header carrying the client IP (requires running behind a proxy)
    pub client_ip_header: Option<HeaderName>,
}

impl ServerConfig {
    /// Fresh rotation store sharing this configuration's keys.
    pub fn rotation_store(&self) -> Arc<RefreshRotationStore> {
        Arc::new(RefreshRotationStore::new(
            self.jwt.clone(),
            self.refresh_rate_limit,
        ))
    }
}

/// Create the application router with the given configuration.
///
/// `downstream` receives every request the gate admits, after locale and
/// identity headers have been attached (and the URI possibly rewritten).
pub fn create_app(
    config: &ServerConfig,
    rotation: Arc<RefreshRotationStore>,
    downstream: Router,
) -> Router {
    let gate = Arc::new(RequestGate::new(
        config.gate.clone(),
        config.locales.clone(),
        config.jwt.clone(),
        config.membership_probe.clone(),
    ));

    let auth_router = create_auth_router(
        config.jwt.clone(),
        rotation,
        config.identity_source.clone(),
        config.secure_cookies,
        LoginRateLimit::with_defaults(config.client_ip_header.clone()),
    );

    let inner = Router::new()
        .nest("/auth", auth_router)
        .merge(create_reauth_router(&config.gate.reauth_path))
        .merge(downstream);

    // Wrap the whole router rather than `Router::layer` so that a rewritten
    // URI is routed again.
    let gated = middleware::from_fn_with_state(gate, gate_middleware).layer(inner);
    Router::new().fallback_service(gated)
}

/// Run the server on the given listener. This function blocks until the server exits.
/// Spawns the periodic cleanup of expired refresh chains.
pub async fn run_server(
    config: ServerConfig,
    downstream: Router,
    listener: TcpListener,
) -> Result<(), std::io::Error> {
    let rotation = config.rotation_store();
    cleanup::spawn_cleanup_scheduler(rotation.clone());

    let app = create_app(&config, rotation, downstream);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    downstream: Router,
    port: u16,
) -> (tokio::task::JoinHandle<()>, SocketAddr) {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    let local_addr = listener.local_addr().expect("Failed to get local address");

    let handle = tokio::spawn(async move {
        run_server(config, downstream, listener).await.ok();
    });

    (handle, local_addr)
}
