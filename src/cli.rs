//! CLI argument parsing, validation, and startup helpers.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use clap::Parser;
use tracing::error;
use url::Url;

use crate::ServerConfig;
use crate::gate::GateSettings;
use crate::identity::HttpIdentitySource;
use crate::jwt::{DEFAULT_ACCESS_TTL_SECS, DEFAULT_CLOCK_SKEW_SECS, DEFAULT_REFRESH_TTL_SECS, JwtConfig};
use crate::locale::LocaleResolver;
use crate::membership::HttpMembershipProbe;
use crate::upstream::UpstreamProxy;

const PRIVATE_KEY_ENV: &str = "JWT_PRIVATE_KEY";
const PUBLIC_KEY_ENV: &str = "JWT_PUBLIC_KEY";

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "portal-gate",
    about = "Edge authentication and request gating for the family portal"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORTAL_GATE_PORT", default_value = "8080")]
    pub port: u16,

    /// Origin that admitted requests are forwarded to (e.g. "http://127.0.0.1:3000")
    #[arg(long, env = "PORTAL_GATE_UPSTREAM", value_parser = parse_http_url)]
    pub upstream: Url,

    /// Membership endpoint queried for every protected request
    #[arg(long, env = "PORTAL_GATE_MEMBERSHIP_URL", value_parser = parse_http_url)]
    pub membership_url: Url,

    /// Identity endpoint that verifies `idToken`s on login
    #[arg(long, env = "PORTAL_GATE_IDENTITY_URL", value_parser = parse_http_url)]
    pub identity_url: Url,

    /// Identity endpoint that returns a subject's current identity on refresh
    #[arg(long, env = "PORTAL_GATE_IDENTITY_LOOKUP_URL", value_parser = parse_http_url)]
    pub identity_lookup_url: Url,

    /// Ed25519 private key (PKCS#8 PEM). Prefer the JWT_PRIVATE_KEY env var instead
    #[arg(long)]
    pub private_key_file: Option<String>,

    /// Ed25519 public key (SPKI PEM). Prefer the JWT_PUBLIC_KEY env var instead
    #[arg(long)]
    pub public_key_file: Option<String>,

    /// Supported locales, comma separated
    #[arg(long, env = "PORTAL_GATE_LOCALES", value_delimiter = ',', default_value = "en,he")]
    pub locales: Vec<String>,

    /// Locale used when nothing else matches
    #[arg(long, env = "PORTAL_GATE_DEFAULT_LOCALE", default_value = "en")]
    pub default_locale: String,

    /// Omit the Secure flag on cookies (local HTTP development only)
    #[arg(long, env = "PORTAL_GATE_INSECURE_COOKIES")]
    pub insecure_cookies: bool,

    /// Access token lifetime in seconds
    #[arg(long, env = "PORTAL_GATE_ACCESS_TTL", default_value_t = DEFAULT_ACCESS_TTL_SECS,
        value_parser = clap::value_parser!(i64).range(1..))]
    pub access_ttl: i64,

    /// Refresh token lifetime in seconds
    #[arg(long, env = "PORTAL_GATE_REFRESH_TTL", default_value_t = DEFAULT_REFRESH_TTL_SECS,
        value_parser = clap::value_parser!(i64).range(1..))]
    pub refresh_ttl: i64,

    /// Tolerated clock difference when checking token expiry, in seconds
    #[arg(long, env = "PORTAL_GATE_CLOCK_SKEW", default_value_t = DEFAULT_CLOCK_SKEW_SECS)]
    pub clock_skew: u64,

    /// Minimum seconds between refreshes for one subject (0 disables)
    #[arg(long, env = "PORTAL_GATE_REFRESH_WINDOW", default_value = "5")]
    pub refresh_window: u64,

    /// Membership probe timeout in milliseconds
    #[arg(long, env = "PORTAL_GATE_PROBE_TIMEOUT_MS", default_value = "2500")]
    pub probe_timeout_ms: u64,

    /// Identity and upstream request timeout in seconds
    #[arg(long, env = "PORTAL_GATE_UPSTREAM_TIMEOUT", default_value = "30")]
    pub upstream_timeout: u64,

    /// Header carrying the client IP when running behind a proxy (e.g. "x-forwarded-for")
    #[arg(long, env = "PORTAL_GATE_CLIENT_IP_HEADER", value_parser = parse_header_name)]
    pub client_ip_header: Option<HeaderName>,

    /// Log output format
    #[arg(short, long, env = "PORTAL_GATE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,
}

fn parse_http_url(s: &str) -> Result<Url, String> {
    let url = Url::parse(s).map_err(|e| format!("Invalid URL {}: {}", s, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("URL must use http or https, got {}", other)),
    }
}

fn parse_header_name(s: &str) -> Result<HeaderName, String> {
    HeaderName::from_bytes(s.trim().as_bytes())
        .map_err(|_| format!("Invalid header name: {}", s))
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// PEM encoded signing material.
pub struct SigningKeys {
    pub private_pem: String,
    pub public_pem: String,
}

/// Load the key pair from environment variables or files.
/// Returns None and logs an error if either key cannot be loaded.
pub fn load_signing_keys(
    private_key_file: Option<&str>,
    public_key_file: Option<&str>,
) -> Option<SigningKeys> {
    let private_pem = load_key(PRIVATE_KEY_ENV, private_key_file, "--private-key-file")?;
    let public_pem = load_key(PUBLIC_KEY_ENV, public_key_file, "--public-key-file")?;
    Some(SigningKeys {
        private_pem,
        public_pem,
    })
}

fn load_key(env_var: &str, file: Option<&str>, flag: &str) -> Option<String> {
    if let Ok(pem) = std::env::var(env_var) {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var(env_var) };
        return Some(pem);
    }

    match file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read key file");
                None
            }
        },
        None => {
            error!(
                "Signing key missing. Set {} environment variable (recommended) or use {}",
                env_var, flag
            );
            None
        }
    }
}

/// Build ServerConfig from validated arguments.
/// Returns None and logs an error if any component fails to initialize.
pub fn build_config(args: &Args, keys: &SigningKeys) -> Option<ServerConfig> {
    let jwt = match JwtConfig::from_ed_pem(keys.private_pem.as_bytes(), keys.public_pem.as_bytes()) {
        Ok(jwt) => jwt
            .with_ttls(args.access_ttl, args.refresh_ttl)
            .with_clock_skew(args.clock_skew),
        Err(e) => {
            error!(error = %e, "Failed to load signing keys");
            return None;
        }
    };

    let locales = match LocaleResolver::new(&args.locales, &args.default_locale) {
        Ok(locales) => locales,
        Err(e) => {
            error!(error = %e, "Invalid locale configuration");
            return None;
        }
    };

    let probe_timeout = Duration::from_millis(args.probe_timeout_ms);
    let membership_probe = match HttpMembershipProbe::new(args.membership_url.clone(), probe_timeout)
    {
        Ok(probe) => probe,
        Err(e) => {
            error!(error = %e, "Failed to build membership client");
            return None;
        }
    };

    let upstream_timeout = Duration::from_secs(args.upstream_timeout);
    let identity_source = match HttpIdentitySource::new(
        args.identity_url.clone(),
        args.identity_lookup_url.clone(),
        upstream_timeout,
    ) {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "Failed to build identity client");
            return None;
        }
    };

    Some(ServerConfig {
        jwt: Arc::new(jwt),
        secure_cookies: !args.insecure_cookies,
        locales,
        gate: GateSettings {
            probe_timeout,
            ..GateSettings::default()
        },
        refresh_rate_limit: Duration::from_secs(args.refresh_window),
        membership_probe: Arc::new(membership_probe),
        identity_source: Arc::new(identity_source),
        client_ip_header: args.client_ip_header.clone(),
    })
}

/// Build the forwarder for admitted requests.
pub fn build_upstream(args: &Args) -> Option<UpstreamProxy> {
    match UpstreamProxy::new(args.upstream.clone(), Duration::from_secs(args.upstream_timeout)) {
        Ok(proxy) => Some(proxy),
        Err(e) => {
            error!(error = %e, "Failed to build upstream client");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "portal-gate",
            "--upstream",
            "http://127.0.0.1:3000",
            "--membership-url",
            "http://127.0.0.1:3000/api/membership",
            "--identity-url",
            "http://127.0.0.1:3000/api/identity/verify",
            "--identity-lookup-url",
            "http://127.0.0.1:3000/api/identity/current",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = args(&[]);

        assert_eq!(args.port, 8080);
        assert_eq!(args.locales, vec!["en", "he"]);
        assert_eq!(args.default_locale, "en");
        assert_eq!(args.access_ttl, DEFAULT_ACCESS_TTL_SECS);
        assert_eq!(args.refresh_window, 5);
        assert!(!args.insecure_cookies);
        assert!(args.client_ip_header.is_none());
    }

    #[test]
    fn test_locale_list_and_ip_header() {
        let args = args(&[
            "--locales",
            "en,he,ru",
            "--client-ip-header",
            "X-Forwarded-For",
        ]);

        assert_eq!(args.locales, vec!["en", "he", "ru"]);
        assert_eq!(
            args.client_ip_header,
            Some(HeaderName::from_static("x-forwarded-for"))
        );
    }

    #[test]
    fn test_rejects_non_http_urls_and_zero_ttl() {
        assert!(
            Args::try_parse_from([
                "portal-gate",
                "--upstream",
                "ftp://example.com",
                "--membership-url",
                "http://a/",
                "--identity-url",
                "http://b/",
                "--identity-lookup-url",
                "http://b/current",
            ])
            .is_err()
        );

        assert!(
            Args::try_parse_from([
                "portal-gate",
                "--upstream",
                "http://a/",
                "--membership-url",
                "http://a/",
                "--identity-url",
                "http://b/",
                "--identity-lookup-url",
                "http://b/current",
                "--access-ttl",
                "0",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_build_config_from_keys() {
        let keys = SigningKeys {
            private_pem: include_str!("../tests/fixtures/ed25519_private.pem").to_string(),
            public_pem: include_str!("../tests/fixtures/ed25519_public.pem").to_string(),
        };
        let config = build_config(&args(&["--insecure-cookies"]), &keys).unwrap();

        assert!(!config.secure_cookies);
        assert_eq!(config.locales.default_locale(), "en");
        assert_eq!(config.refresh_rate_limit, Duration::from_secs(5));

        let bad = SigningKeys {
            private_pem: "not a key".to_string(),
            public_pem: keys.public_pem.clone(),
        };
        assert!(build_config(&args(&[]), &bad).is_none());
    }
}
