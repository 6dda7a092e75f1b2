//! Declarative path classification.
//!
//! The table holds exact and prefix patterns; the longest matching pattern
//! wins and anything unmatched is protected. Prefixes match on segment
//! boundaries, so `/blog` covers `/blog` and `/blog/2024` but not `/blogger`.

/// What the gate does with a (locale-stripped) path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// No authentication, served as-is (assets, auth endpoints)
    Public,
    /// No authentication, canonicalised to a locale-prefixed URL
    LocalizedPublic,
    /// Login page: open to anonymous users, bounced home once signed in
    LoginPage,
    /// Page where pending accounts choose credentials
    CredentialSetupPage,
    /// Invitation acceptance, reachable before credential setup
    Invitation,
    /// API endpoints a pending account may still call (credential setup, logout)
    SetupExemptApi,
    /// The membership endpoint the gate itself probes
    MembershipApi,
    /// Everything else
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Matching {
    Exact,
    Prefix,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    pattern: String,
    matching: Matching,
    kind: RouteKind,
}

impl RouteEntry {
    fn matches(&self, path: &str) -> bool {
        match self.matching {
            Matching::Exact => path == self.pattern,
            Matching::Prefix => prefix_matches(&self.pattern, path),
        }
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern matching only `path` itself.
    pub fn exact(mut self, path: &str, kind: RouteKind) -> Self {
        self.entries.push(RouteEntry {
            pattern: path.to_string(),
            matching: Matching::Exact,
            kind,
        });
        self
    }

    /// Add a pattern matching `path` and everything below it.
    pub fn prefix(mut self, path: &str, kind: RouteKind) -> Self {
        self.entries.push(RouteEntry {
            pattern: path.trim_end_matches('/').to_string(),
            matching: Matching::Prefix,
            kind,
        });
        self
    }

    pub fn classify(&self, path: &str) -> RouteKind {
        self.entries
            .iter()
            .filter(|entry| entry.matches(path))
            // Longest pattern wins; on equal length an exact entry beats a prefix.
            .max_by_key(|entry| (entry.pattern.len(), entry.matching == Matching::Exact))
            .map(|entry| entry.kind)
            .unwrap_or(RouteKind::Protected)
    }

    /// Routes of the family portal.
    pub fn portal() -> Self {
        use RouteKind::*;

        Self::new()
            .exact("/", LocalizedPublic)
            .prefix("/blog", LocalizedPublic)
            .prefix("/about", LocalizedPublic)
            .prefix("/login", LoginPage)
            .exact("/reauth", Public)
            .exact("/auth/login", Public)
            .exact("/auth/refresh", Public)
            .exact("/auth/logout", Public)
            .prefix("/static", Public)
            .prefix("/_next", Public)
            .exact("/favicon.ico", Public)
            .exact("/robots.txt", Public)
            .prefix("/setup-credentials", CredentialSetupPage)
            .prefix("/invite", Invitation)
            .prefix("/api/account/credentials", SetupExemptApi)
            .prefix("/api/logout", SetupExemptApi)
            .prefix("/api/membership", MembershipApi)
    }
}
