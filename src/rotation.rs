//! Refresh token rotation with reuse detection.
//!
//! Each subject has exactly one live rotation chain: the store remembers the
//! SHA-256 of the one refresh token currently allowed to be exchanged. A
//! successful exchange replaces it; presenting anything else for that
//! subject (typically a token that was already rotated away) deletes the
//! record and forces a full login.
//!
//! State lives in process memory, so it is only correct for a single gate
//! instance. Horizontally scaled deployments need a shared store with
//! compare-and-swap keyed by subject.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::identity::Identity;
use crate::jwt::{JwtConfig, JwtError, RefreshClaims, SignedRefreshToken, SignedToken};

/// Minimum spacing between refresh attempts for one subject.
pub const DEFAULT_REFRESH_RATE_LIMIT: Duration = Duration::from_secs(5);

/// Tokens minted by a successful rotation.
#[derive(Debug, Clone)]
pub struct RotatedTokens {
    pub identity: Identity,
    pub access: SignedToken,
    pub refresh: SignedRefreshToken,
}

#[derive(Debug)]
pub enum RotationError {
    /// Presented token failed verification
    Invalid(JwtError),
    /// Subject refreshed too recently; the presented token is still usable
    RateLimited,
    /// Presented token is not the subject's current one; chain revoked
    ReuseDetected,
    /// Replacement identity names a different subject or tenant; chain revoked
    SubjectMismatch,
    /// Minting the replacement tokens failed
    Signing(JwtError),
}

impl std::fmt::Display for RotationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationError::Invalid(e) => write!(f, "Invalid refresh token: {}", e),
            RotationError::RateLimited => write!(f, "Refresh rate limited"),
            RotationError::ReuseDetected => write!(f, "Refresh token reuse detected"),
            RotationError::SubjectMismatch => {
                write!(f, "Replacement identity does not match the token subject")
            }
            RotationError::Signing(e) => write!(f, "Failed to sign rotated tokens: {}", e),
        }
    }
}

impl std::error::Error for RotationError {}

struct ChainRecord {
    /// SHA-256 of the current refresh token
    hash: String,
    /// Unix seconds after which the token can no longer verify
    expires_at: i64,
}

impl ChainRecord {
    fn new(refresh: &SignedToken) -> Self {
        Self {
            hash: hash_token(&refresh.token),
            expires_at: refresh.expires_at,
        }
    }
}

#[derive(Default)]
struct RotationState {
    /// subject -> current refresh token
    records: HashMap<String, ChainRecord>,
    /// subject -> last refresh attempt
    last_attempt: HashMap<String, Instant>,
}

pub struct RefreshRotationStore {
    jwt: Arc<JwtConfig>,
    rate_limit_window: Duration,
    state: Mutex<RotationState>,
}

impl RefreshRotationStore {
    pub fn new(jwt: Arc<JwtConfig>, rate_limit_window: Duration) -> Self {
        Self {
            jwt,
            rate_limit_window,
            state: Mutex::new(RotationState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RotationState> {
        // The critical sections never leave the maps half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sign a refresh token for `identity` and make it the subject's only valid one.
    pub fn issue(&self, identity: &Identity) -> Result<SignedRefreshToken, JwtError> {
        let refresh = self.jwt.sign_refresh(identity, self.jwt.refresh_ttl())?;

        let previous = self
            .state()
            .records
            .insert(identity.subject_id.clone(), ChainRecord::new(&refresh.signed));
        if previous.is_some() {
            debug!(subject = %identity.subject_id, "Replaced existing refresh chain");
        }

        Ok(refresh)
    }

    /// Exchange a refresh token for a new access/refresh pair carrying the
    /// identity stamped into the presented token.
    pub fn verify_and_rotate(&self, presented: &str) -> Result<RotatedTokens, RotationError> {
        let claims = self.verify(presented)?;
        let identity = claims.identity.clone();
        self.rotate_with(presented, &claims, identity)
    }

    /// Signature, expiry and token-type check of a presented refresh token.
    /// Does not touch the chain.
    pub fn verify(&self, presented: &str) -> Result<RefreshClaims, RotationError> {
        self.jwt
            .verify_refresh(presented)
            .map_err(RotationError::Invalid)
    }

    /// Rotate a token already checked with [`verify`](Self::verify), minting
    /// the new pair for `identity` (the directory's current view of the
    /// subject). The chain is keyed by the subject in `claims`.
    pub fn rotate_with(
        &self,
        presented: &str,
        claims: &RefreshClaims,
        identity: Identity,
    ) -> Result<RotatedTokens, RotationError> {
        let subject = claims.identity.subject_id.clone();

        if identity.subject_id != subject || identity.tenant_id != claims.identity.tenant_id {
            let had_chain = self.revoke(&subject);
            warn!(
                subject = %subject,
                replacement = %identity.subject_id,
                had_chain,
                "Replacement identity mismatch, chain revoked"
            );
            return Err(RotationError::SubjectMismatch);
        }

        let mut state = self.state();
        let now = Instant::now();

        if let Some(last) = state.last_attempt.get(&subject) {
            if now.duration_since(*last) < self.rate_limit_window {
                debug!(subject = %subject, "Refresh attempt inside rate limit window");
                return Err(RotationError::RateLimited);
            }
        }
        state.last_attempt.insert(subject.clone(), now);

        let presented_hash = hash_token(presented);
        let current = state.records.get(&subject).map(|r| r.hash.as_str());
        if current != Some(presented_hash.as_str()) {
            let had_chain = state.records.remove(&subject).is_some();
            warn!(
                subject = %subject,
                jti = %claims.jti,
                had_chain,
                "Refresh token reuse detected, chain revoked"
            );
            return Err(RotationError::ReuseDetected);
        }

        let access = self
            .jwt
            .sign_access(&identity, self.jwt.access_ttl())
            .map_err(RotationError::Signing)?;
        let refresh = self
            .jwt
            .sign_refresh(&identity, self.jwt.refresh_ttl())
            .map_err(RotationError::Signing)?;

        state
            .records
            .insert(subject.clone(), ChainRecord::new(&refresh.signed));
        drop(state);

        info!(subject = %subject, jti = %refresh.jti, "Rotated refresh token");

        Ok(RotatedTokens {
            identity,
            access,
            refresh,
        })
    }

    /// Drop the subject's rotation chain. Returns whether one existed.
    pub fn revoke(&self, subject_id: &str) -> bool {
        self.state().records.remove(subject_id).is_some()
    }

    pub fn has_active_chain(&self, subject_id: &str) -> bool {
        self.state().records.contains_key(subject_id)
    }

    /// Drop chains whose refresh token has expired (allowing for clock skew)
    /// and rate-limit entries older than the window. Returns the number of
    /// chains removed.
    pub fn prune_expired(&self) -> usize {
        let now = unix_now();
        let cutoff = now - self.jwt.clock_skew();
        let window = self.rate_limit_window;

        let mut state = self.state();
        let before = state.records.len();
        state.records.retain(|_, record| record.expires_at > cutoff);
        state
            .last_attempt
            .retain(|_, last| last.elapsed() < window);

        before - state.records.len()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
