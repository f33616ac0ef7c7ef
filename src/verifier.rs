use std::{fmt, sync::Arc};

use jsonwebtoken::{
    decode, decode_header, errors::ErrorKind, get_current_timestamp, Algorithm, DecodingKey,
    Validation,
};
use serde::Deserialize;

use crate::{config::AppCheckConfig, jwks_cache::KeySetCache, Rejection};

/// Identity of a verified caller: the `sub` claim of its App Check token, i.e. the app ID.
///
/// Suitable for authorization decisions, but it has not been validated for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppId(pub String);

impl AppId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claims of an App Check token.
#[derive(Debug, Deserialize)]
struct AppCheckClaims {
    iss: String,
    sub: String,
    aud: Audience,
    exp: u64,
    iat: Option<u64>,
    nbf: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(single) => single == audience,
            Audience::Multiple(multiple) => multiple.iter().any(|entry| entry == audience),
        }
    }
}

/// Decides whether an App Check token is trusted.
///
/// Checks run in a fixed order and stop at the first failure:
///
/// 1. the token is not empty,
/// 2. the header decodes and names a `kid`,
/// 3. the `kid` is in the key set, after at most one refresh of the key set,
/// 4. the signature verifies and the claims decode,
/// 5. the token is not expired and not used before it became valid,
/// 6. the header's `alg` is the configured algorithm,
/// 7. the header's `typ` is the configured type,
/// 8. the audience contains `projects/<project number>`,
/// 9. the issuer matches (see [`issuer_matches`]).
#[derive(Clone)]
pub struct TokenVerifier {
    keys: KeySetCache,
    algorithm: Algorithm,
    token_type: String,
    audience: String,
    issuer: String,
}

impl TokenVerifier {
    pub fn new(config: &AppCheckConfig, keys: KeySetCache) -> Self {
        Self {
            keys,
            algorithm: config.algorithm,
            token_type: config.token_type.clone(),
            audience: config.expected_audience(),
            issuer: config.expected_issuer(),
        }
    }

    pub fn key_set_cache(&self) -> &KeySetCache {
        &self.keys
    }

    /// Verifies `token` and returns the app ID it attests.
    pub async fn verify(&self, token: &str) -> Result<AppId, Rejection> {
        let result = self.check(token).await;
        match &result {
            Ok(app_id) => tracing::info!(%app_id, "app check token is valid"),
            Err(rejection) => tracing::warn!(reason = %rejection, "app check token rejected"),
        }
        result
    }

    async fn check(&self, token: &str) -> Result<AppId, Rejection> {
        if token.is_empty() {
            return Err(Rejection::MissingToken);
        }

        let header = decode_header(token).map_err(|_| Rejection::MalformedToken)?;
        let kid = header.kid.as_deref().ok_or(Rejection::MalformedToken)?;

        let key = self.resolve_key(kid).await?;
        let claims = verify_signature(token, &key, header.alg)?;

        check_validity_window(&claims, get_current_timestamp())?;

        // The algorithm is pinned so that a token cannot pick a weaker one.
        if header.alg != self.algorithm {
            return Err(Rejection::InvalidAlgorithm);
        }
        if header.typ.as_deref() != Some(self.token_type.as_str()) {
            return Err(Rejection::InvalidType);
        }
        if !claims.aud.contains(&self.audience) {
            return Err(Rejection::InvalidAudience);
        }
        if !issuer_matches(&claims.iss, &self.issuer) {
            return Err(Rejection::InvalidIssuer);
        }

        Ok(AppId(claims.sub))
    }

    /// Looks up `kid`, refreshing the key set once if it is unknown.
    async fn resolve_key(&self, kid: &str) -> Result<Arc<DecodingKey>, Rejection> {
        let snapshot = self.keys.snapshot();
        if let Some(key) = snapshot.get(kid) {
            return Ok(key);
        }

        tracing::debug!(
            kid,
            generation = snapshot.generation(),
            "unknown kid, refreshing key set"
        );
        // Failures are logged by the cache; the lookup below reports the miss.
        let _ = self.keys.refresh_if_unchanged(snapshot.generation()).await;

        self.keys.get(kid).ok_or(Rejection::UnknownKey)
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .field("token_type", &self.token_type)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Verifies the signature of `token` under `algorithm` and decodes its claims.
///
/// Only the signature and the shape of the claims are checked here.
fn verify_signature(
    token: &str,
    key: &DecodingKey,
    algorithm: Algorithm,
) -> Result<AppCheckClaims, Rejection> {
    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;

    decode::<AppCheckClaims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            // The header's algorithm cannot be used with the resolved key.
            ErrorKind::InvalidAlgorithm => Rejection::InvalidAlgorithm,
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Crypto(_) => Rejection::InvalidSignature,
            _ => Rejection::MalformedToken,
        })
}

fn check_validity_window(claims: &AppCheckClaims, now: u64) -> Result<(), Rejection> {
    if now >= claims.exp {
        return Err(Rejection::Expired);
    }
    let not_before = claims.nbf.into_iter().chain(claims.iat).max();
    if not_before.is_some_and(|not_before| not_before > now) {
        return Err(Rejection::NotYetValid);
    }
    Ok(())
}

/// Issuer policy: the `iss` claim must contain the expected issuer.
///
/// This is a containment check rather than an exact match. Tightening it only requires changing
/// this function.
pub fn issuer_matches(issuer: &str, expected: &str) -> bool {
    issuer.contains(expected)
}
