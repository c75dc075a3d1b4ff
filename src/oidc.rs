//! OIDC token verification — JWT signature validation and JWKS caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Read the unverified `iss` claim and require it to be in the configured
//!    allowed-issuer set.
//! 3. Resolve the issuer's JWKS: per-issuer cache with a 5-minute TTL; on a
//!    miss, run OIDC discovery (`<iss>/.well-known/openid-configuration` →
//!    `jwks_uri`), validating **both** URLs against the SSRF guard before
//!    fetching.
//! 4. Find the JWK matching `kid`, verify the signature and `exp`, then check
//!    `iat` against a 60-second forward skew and the audience when one is
//!    configured.
//!
//! Concurrent verifications for the same issuer may race on a cache miss and
//! fetch the JWKS more than once; the last writer wins.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fetch::{self, FetchError};
use crate::security::{UrlGuardError, validate_fetch_url};

/// How long a fetched JWKS stays fresh.
pub const JWKS_TTL: Duration = Duration::from_secs(300);

/// Forward clock-skew tolerance for `iat`.
const IAT_SKEW_SECS: u64 = 60;

/// Error variants for OIDC verification failures.
///
/// All of them map to a 401 at the HTTP boundary; the variants exist so the
/// verifier can be tested and logged precisely.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// JWT decode / signature verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The token's issuer is not in the allowed set.
    #[error("Issuer not allowed: {0}")]
    IssuerNotAllowed(String),

    /// The JWT header carries no `kid`.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the issuer's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The JWT `alg` is outside the allow-list.
    #[error("JWT algorithm not allowed: {0:?}")]
    AlgorithmNotAllowed(Algorithm),

    /// Discovery or JWKS URL failed the SSRF guard.
    #[error("Blocked fetch URL: {0}")]
    BlockedUrl(#[from] UrlGuardError),

    /// Network or HTTP failure while fetching discovery/JWKS documents.
    #[error("JWKS fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// The discovery document has no usable `jwks_uri`.
    #[error("Discovery document for {0} lacks jwks_uri")]
    MissingJwksUri(String),

    /// `iat` is further than the allowed skew into the future.
    #[error("Token issued in the future (iat {iat}, now {now})")]
    IssuedInFuture {
        /// Claimed issued-at (Unix seconds).
        iat: u64,
        /// Server clock (Unix seconds).
        now: u64,
    },

    /// The `aud` claim does not contain the configured audience.
    #[error("Audience mismatch")]
    AudienceMismatch,
}

/// Claims extracted from a verified token.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    /// Issuer URL (`iss`).
    pub issuer: String,
    /// Subject (`sub`) — the workload identity.
    pub subject: String,
    /// Issued-at, Unix seconds.
    pub issued_at: u64,
    /// Expiry, Unix seconds.
    pub expires_at: u64,
}

impl VerifiedClaims {
    /// Rate-limit identity for this caller: `issuer + ":" + subject`.
    #[must_use]
    pub fn rate_limit_identity(&self) -> String {
        format!("{}:{}", self.issuer, self.subject)
    }
}

/// Raw claims deserialized during verification.
#[derive(Debug, Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    /// May be a single string or an array.
    #[serde(default)]
    aud: serde_json::Value,
    exp: u64,
    iat: u64,
}

/// OIDC discovery document — only the field the verifier consumes.
#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: Option<String>,
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= JWKS_TTL
    }
}

/// JWKS cache — one entry per OIDC issuer, shared across request tasks.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
}

impl JwksCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    fn get_fresh(&self, issuer: &str) -> Option<JwkSet> {
        let cached = self.inner.get(issuer)?;
        if cached.is_stale() {
            return None;
        }
        Some(cached.keys.clone())
    }

    fn insert(&self, issuer: &str, keys: JwkSet) {
        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys,
                fetched_at: Instant::now(),
            },
        );
    }
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

/// OIDC token verifier — allowed-issuer set, optional audience, JWKS cache.
pub struct OidcVerifier {
    allowed_issuers: HashSet<String>,
    audience: Option<String>,
    jwks_cache: JwksCache,
    client: reqwest::Client,
    fetch_deadline: Duration,
}

impl OidcVerifier {
    /// Create a verifier.
    #[must_use]
    pub fn new(
        allowed_issuers: impl IntoIterator<Item = String>,
        audience: Option<String>,
        fetch_deadline: Duration,
    ) -> Self {
        Self {
            allowed_issuers: allowed_issuers.into_iter().collect(),
            audience,
            jwks_cache: JwksCache::new(),
            client: fetch::build_client(fetch_deadline),
            fetch_deadline,
        }
    }

    /// Verify a compact JWT and return the extracted claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError`] if the token is malformed, expired, from a
    /// disallowed issuer, signed with an unknown key, or if the JWKS cannot
    /// be fetched safely.
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, OidcError> {
        let header = jsonwebtoken::decode_header(token)?;

        // Unverified read of `iss`: needed before we know whose keys to use.
        let unverified = extract_unverified_claims(token)?;
        if !self.allowed_issuers.contains(&unverified.iss) {
            return Err(OidcError::IssuerNotAllowed(unverified.iss));
        }
        let issuer = unverified.iss.as_str();

        let alg = allowed_algorithm(header.alg)?;
        let kid = header.kid.ok_or(OidcError::MissingKeyId)?;

        let decoding_key = self.find_decoding_key(issuer, &kid).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = 0; // exp > now, strictly
        validation.validate_exp = true;
        // Audience handled manually below: the claim may be a string or an
        // array, and a missing configured audience must not fail validation.
        validation.validate_aud = false;

        let token_data: TokenData<RawClaims> =
            jsonwebtoken::decode(token, &decoding_key, &validation)?;
        let claims = token_data.claims;

        let now = unix_now();
        if claims.iat > now + IAT_SKEW_SECS {
            return Err(OidcError::IssuedInFuture {
                iat: claims.iat,
                now,
            });
        }

        if let Some(ref expected) = self.audience {
            if !audience_contains(&claims.aud, expected) {
                return Err(OidcError::AudienceMismatch);
            }
        }

        Ok(VerifiedClaims {
            issuer: claims.iss,
            subject: claims.sub,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if not found.
    async fn find_decoding_key(&self, issuer: &str, kid: &str) -> Result<DecodingKey, OidcError> {
        if let Some(jwks) = self.jwks_cache.get_fresh(issuer) {
            if let Some(key) = find_key_in_jwks(&jwks, kid) {
                return Ok(key);
            }
            debug!(kid = %kid, issuer = %issuer, "Key not in cached JWKS, refreshing");
        }

        let jwks = self.fetch_jwks(issuer).await?;
        self.jwks_cache.insert(issuer, jwks.clone());
        find_key_in_jwks(&jwks, kid).ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }

    /// OIDC discovery then JWKS fetch, both URL-guarded.
    async fn fetch_jwks(&self, issuer: &str) -> Result<JwkSet, OidcError> {
        let config_url = validate_fetch_url(&discovery_url(issuer))?;
        let discovery: DiscoveryDocument =
            fetch::fetch_json_with_timeout(&self.client, &config_url, self.fetch_deadline).await?;

        let jwks_uri = discovery
            .jwks_uri
            .ok_or_else(|| OidcError::MissingJwksUri(issuer.to_string()))?;
        let jwks_url = validate_fetch_url(&jwks_uri)?;

        debug!(issuer = %issuer, jwks_uri = %jwks_url, "Fetching JWKS");
        let jwks: JwkSet =
            fetch::fetch_json_with_timeout(&self.client, &jwks_url, self.fetch_deadline).await?;
        Ok(jwks)
    }
}

/// Seconds since the Unix epoch.
fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Derive the discovery URL from the issuer URL.
fn discovery_url(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/openid-configuration")
}

/// Restrict to the asymmetric algorithms this service accepts.
fn allowed_algorithm(alg: Algorithm) -> Result<Algorithm, OidcError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        other => {
            warn!(alg = ?other, "Rejected JWT algorithm");
            Err(OidcError::AlgorithmNotAllowed(other))
        }
    }
}

/// Extract claims from a JWT without signature verification.
///
/// Used only to read `iss` before we know which keys to verify with.
fn extract_unverified_claims(token: &str) -> Result<RawClaims, OidcError> {
    let parts: Vec<&str> = token.splitn(3, '.').collect();
    if parts.len() < 2 {
        return Err(OidcError::Jwt(jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidToken,
        )));
    }

    let payload =
        base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, parts[1])
            .map_err(|_| {
                OidcError::Jwt(jsonwebtoken::errors::Error::from(
                    jsonwebtoken::errors::ErrorKind::InvalidToken,
                ))
            })?;

    serde_json::from_slice::<RawClaims>(&payload).map_err(|_| {
        OidcError::Jwt(jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidToken,
        ))
    })
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Check that the token's `aud` claim (string or array) contains `expected`.
fn audience_contains(aud_claim: &serde_json::Value, expected: &str) -> bool {
    match aud_claim {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s == expected)),
        _ => false,
    }
}
