//! JWT token signing and verification.
//!
//! Tokens are signed with Ed25519 (EdDSA): the private key never leaves the
//! gate, and anything holding the public key can verify. Access and refresh
//! tokens share the signing primitive but carry different audiences, so one
//! can never be presented in place of the other.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::Identity;

/// Audience stamped into access tokens.
pub const ACCESS_AUDIENCE: &str = "portal:access";

/// Audience stamped into refresh tokens.
pub const REFRESH_AUDIENCE: &str = "portal:refresh";

/// Access token duration: 10 minutes
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 10 * 60;

/// Refresh token duration: 2 weeks
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 14 * 24 * 60 * 60;

/// Tolerated drift between nodes when checking `exp`.
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 5;

/// JWT claims for access tokens (stateless).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(flatten)]
    pub identity: Identity,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub aud: String,
}

/// JWT claims for refresh tokens (tracked by the rotation store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// JWT ID, unique per issued refresh token
    pub jti: String,
    #[serde(flatten)]
    pub identity: Identity,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// A freshly signed token.
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    /// Issued at timestamp (Unix seconds)
    pub issued_at: i64,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: i64,
    /// Lifetime in seconds, used as the cookie `Max-Age`
    pub ttl: i64,
}

/// A freshly signed refresh token together with its JTI.
#[derive(Debug, Clone)]
pub struct SignedRefreshToken {
    pub jti: String,
    pub signed: SignedToken,
}

/// Signing and verification keys plus token lifetimes.
#[derive(Clone)]
pub struct JwtConfig {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: i64,
    refresh_ttl: i64,
    clock_skew: u64,
}

impl JwtConfig {
    /// Create a JWT configuration from a PKCS#8 Ed25519 private key and its
    /// SPKI public key, both PEM encoded.
    pub fn from_ed_pem(private_pem: &[u8], public_pem: &[u8]) -> Result<Self, JwtError> {
        let encoding_key = EncodingKey::from_ed_pem(private_pem).map_err(JwtError::InvalidKey)?;
        let decoding_key = DecodingKey::from_ed_pem(public_pem).map_err(JwtError::InvalidKey)?;

        Ok(Self {
            encoding_key,
            decoding_key,
            access_ttl: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl: DEFAULT_REFRESH_TTL_SECS,
            clock_skew: DEFAULT_CLOCK_SKEW_SECS,
        })
    }

    pub fn with_ttls(mut self, access_ttl: i64, refresh_ttl: i64) -> Self {
        self.access_ttl = access_ttl;
        self.refresh_ttl = refresh_ttl;
        self
    }

    pub fn with_clock_skew(mut self, clock_skew_secs: u64) -> Self {
        self.clock_skew = clock_skew_secs;
        self
    }

    pub fn access_ttl(&self) -> i64 {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> i64 {
        self.refresh_ttl
    }

    /// Tolerated clock difference in seconds.
    pub fn clock_skew(&self) -> i64 {
        self.clock_skew as i64
    }

    /// Sign an access token for `identity` valid for `ttl_secs`.
    /// A negative TTL yields an already-expired token.
    pub fn sign_access(&self, identity: &Identity, ttl_secs: i64) -> Result<SignedToken, JwtError> {
        let now = now_secs()?;
        let exp = now + ttl_secs;

        let claims = AccessClaims {
            identity: identity.clone(),
            iat: now,
            exp,
            aud: ACCESS_AUDIENCE.to_string(),
        };

        Ok(SignedToken {
            token: self.encode(&claims)?,
            issued_at: now,
            expires_at: exp,
            ttl: ttl_secs,
        })
    }

    /// Sign a refresh token for `identity` with a fresh JTI.
    pub fn sign_refresh(
        &self,
        identity: &Identity,
        ttl_secs: i64,
    ) -> Result<SignedRefreshToken, JwtError> {
        let now = now_secs()?;
        let exp = now + ttl_secs;
        let jti = uuid::Uuid::new_v4().to_string();

        let claims = RefreshClaims {
            jti: jti.clone(),
            identity: identity.clone(),
            iat: now,
            exp,
            aud: REFRESH_AUDIENCE.to_string(),
        };

        Ok(SignedRefreshToken {
            jti,
            signed: SignedToken {
                token: self.encode(&claims)?,
                issued_at: now,
                expires_at: exp,
                ttl: ttl_secs,
            },
        })
    }

    /// Validate and decode an access token.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, JwtError> {
        self.decode(token, ACCESS_AUDIENCE)
    }

    /// Validate and decode a refresh token.
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, JwtError> {
        self.decode(token, REFRESH_AUDIENCE)
    }

    fn encode<C: Serialize>(&self, claims: &C) -> Result<String, JwtError> {
        jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), claims, &self.encoding_key)
            .map_err(JwtError::Encoding)
    }

    fn decode<C: DeserializeOwned>(&self, token: &str, audience: &str) -> Result<C, JwtError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = self.clock_skew;
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        jsonwebtoken::decode::<C>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(JwtError::from_decode)
    }
}

fn now_secs() -> Result<i64, JwtError> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| JwtError::TimeError)?
        .as_secs();
    i64::try_from(secs).map_err(|_| JwtError::TimeError)
}

/// Errors that can occur during JWT operations.
#[derive(Debug)]
pub enum JwtError {
    /// Structurally invalid token (segments, base64, JSON, missing claims)
    Malformed(jsonwebtoken::errors::Error),
    /// Signature does not match header and payload
    SignatureInvalid,
    /// `exp` is further in the past than the clock skew allows
    Expired,
    /// Audience mismatch, e.g. a refresh token used as an access token
    WrongTokenType,
    /// Key material could not be parsed
    InvalidKey(jsonwebtoken::errors::Error),
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
    /// System time error
    TimeError,
}

impl JwtError {
    fn from_decode(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            ErrorKind::InvalidSignature => JwtError::SignatureInvalid,
            ErrorKind::InvalidAudience => JwtError::WrongTokenType,
            _ => JwtError::Malformed(e),
        }
    }
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::Malformed(e) => write!(f, "Malformed token: {}", e),
            JwtError::SignatureInvalid => write!(f, "Invalid token signature"),
            JwtError::Expired => write!(f, "Token expired"),
            JwtError::WrongTokenType => write!(f, "Wrong token type"),
            JwtError::InvalidKey(e) => write!(f, "Invalid key material: {}", e),
            JwtError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
            JwtError::TimeError => write!(f, "System time error"),
        }
    }
}

impl std::error::Error for JwtError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/ed25519_private.pem");
    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/ed25519_public.pem");
    const OTHER_PUBLIC_PEM: &str = include_str!("../tests/fixtures/ed25519_other_public.pem");

    fn config() -> JwtConfig {
        JwtConfig::from_ed_pem(PRIVATE_PEM.as_bytes(), PUBLIC_PEM.as_bytes()).unwrap()
    }

    fn identity() -> Identity {
        Identity {
            subject_id: "user-123".to_string(),
            tenant_id: "levi-family".to_string(),
            role: Role::Member,
            first_name: "Noa".to_string(),
            last_name: "Levi".to_string(),
            email: "noa@example.com".to_string(),
            needs_credential_setup: false,
        }
    }

    #[test]
    fn test_sign_and_verify_access_token() {
        let config = config();
        let signed = config.sign_access(&identity(), 600).unwrap();

        assert_eq!(signed.expires_at - signed.issued_at, 600);

        let claims = config.verify_access(&signed.token).unwrap();
        assert_eq!(claims.identity, identity());
        assert_eq!(claims.iat, signed.issued_at);
        assert_eq!(claims.exp, signed.expires_at);
        assert_eq!(claims.aud, ACCESS_AUDIENCE);
    }

    #[test]
    fn test_sign_and_verify_refresh_token() {
        let config = config();
        let signed = config.sign_refresh(&identity(), 3600).unwrap();

        assert!(!signed.jti.is_empty());

        let claims = config.verify_refresh(&signed.signed.token).unwrap();
        assert_eq!(claims.identity, identity());
        assert_eq!(claims.jti, signed.jti);
        assert_eq!(claims.aud, REFRESH_AUDIENCE);
    }

    #[test]
    fn test_admin_with_pending_setup_round_trips() {
        let config = config();
        let mut admin = identity();
        admin.role = Role::Admin;
        admin.needs_credential_setup = true;

        let signed = config.sign_access(&admin, 60).unwrap();
        let claims = config.verify_access(&signed.token).unwrap();
        assert_eq!(claims.identity, admin);
    }

    #[test]
    fn test_wrong_token_type_rejected() {
        let config = config();
        let access = config.sign_access(&identity(), 60).unwrap();
        let refresh = config.sign_refresh(&identity(), 60).unwrap();

        assert!(matches!(
            config.verify_refresh(&access.token),
            Err(JwtError::WrongTokenType)
        ));
        assert!(matches!(
            config.verify_access(&refresh.signed.token),
            Err(JwtError::WrongTokenType)
        ));
    }

    #[test]
    fn test_expired_token_rejected_without_skew() {
        let config = config().with_clock_skew(0);
        let signed = config.sign_access(&identity(), -1).unwrap();

        assert!(matches!(
            config.verify_access(&signed.token),
            Err(JwtError::Expired)
        ));
    }

    #[test]
    fn test_expiry_within_clock_skew_still_verifies() {
        let config = config();
        let signed = config.sign_access(&identity(), -2).unwrap();

        assert!(config.verify_access(&signed.token).is_ok());
    }

    #[test]
    fn test_expiry_beyond_clock_skew_rejected() {
        let config = config();
        let signed = config.sign_access(&identity(), -60).unwrap();

        assert!(matches!(
            config.verify_access(&signed.token),
            Err(JwtError::Expired)
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        let config = config();

        for token in ["", "invalid-token", "a.b", "a.b.c", "...."] {
            assert!(
                matches!(config.verify_access(token), Err(JwtError::Malformed(_))),
                "expected Malformed for {:?}",
                token
            );
        }
    }

    #[test]
    fn test_every_signature_character_is_load_bearing() {
        let config = config();
        let signed = config.sign_access(&identity(), 600).unwrap();
        let sig_start = signed.token.rfind('.').unwrap() + 1;

        const ALPHABET: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

        for i in sig_start..signed.token.len() {
            let mut bytes = signed.token.clone().into_bytes();
            // Flip the high bit of the sextet so the decoded bytes always change.
            let value = ALPHABET.iter().position(|&c| c == bytes[i]).unwrap();
            bytes[i] = ALPHABET[value ^ 0b10_0000];
            let tampered = String::from_utf8(bytes).unwrap();

            assert!(
                matches!(
                    config.verify_access(&tampered),
                    Err(JwtError::SignatureInvalid | JwtError::Malformed(_))
                ),
                "tampering signature byte {} should fail verification",
                i - sig_start
            );
        }
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let config = config();
        let signed = config.sign_access(&identity(), 600).unwrap();

        let mut evil = identity();
        evil.role = Role::Admin;
        let forged = config.sign_access(&evil, 600).unwrap();

        // Splice the forged payload onto the original signature.
        let orig: Vec<&str> = signed.token.split('.').collect();
        let other: Vec<&str> = forged.token.split('.').collect();
        let spliced = format!("{}.{}.{}", orig[0], other[1], orig[2]);

        assert!(matches!(
            config.verify_access(&spliced),
            Err(JwtError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = config();
        let verifier =
            JwtConfig::from_ed_pem(PRIVATE_PEM.as_bytes(), OTHER_PUBLIC_PEM.as_bytes()).unwrap();

        let signed = signer.sign_access(&identity(), 600).unwrap();
        assert!(matches!(
            verifier.verify_access(&signed.token),
            Err(JwtError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(matches!(
            JwtConfig::from_ed_pem(b"not a key", PUBLIC_PEM.as_bytes()),
            Err(JwtError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_unique_jti_per_refresh_token() {
        let config = config();
        let first = config.sign_refresh(&identity(), 60).unwrap();
        let second = config.sign_refresh(&identity(), 60).unwrap();

        assert_ne!(
            first.jti, second.jti,
            "Each refresh token should have a unique jti"
        );
        assert_ne!(first.signed.token, second.signed.token);
    }
}
