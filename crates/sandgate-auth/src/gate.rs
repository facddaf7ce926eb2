//! `AccessGate` — verifies bearer tokens.

use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sandgate_core::AuthConfig;

use crate::error::AuthError;
use crate::keys::{CachePolicy, HttpKeySource, KeyCache, StaticKeySource};

/// Who a verified request belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Token expiry, seconds since the epoch (0 for the dev bypass).
    pub expires_at: u64,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    email: Option<String>,
    exp: u64,
}

enum Mode {
    Bypass,
    Verify {
        keys: KeyCache,
        audience: Option<String>,
        issuer: Option<String>,
    },
}

/// Validates bearer credentials against the cached key set.
pub struct AccessGate {
    mode: Mode,
}

impl AccessGate {
    /// Gate that verifies tokens against `keys`.
    pub fn new(keys: KeyCache, audience: Option<String>, issuer: Option<String>) -> Self {
        Self {
            mode: Mode::Verify {
                keys,
                audience,
                issuer,
            },
        }
    }

    /// Gate that lets everything through. Development only.
    pub fn dev_bypass() -> Self {
        Self { mode: Mode::Bypass }
    }

    /// Build from the `[auth]` section.
    ///
    /// `GatewayConfig::validate()` rejects a missing `jwks_url` without
    /// `dev_bypass`; if it gets here anyway the gate refuses everything.
    pub fn from_config(config: &AuthConfig) -> Self {
        match (config.dev_bypass, config.jwks_url.as_deref()) {
            (true, _) => {
                warn!("access gate running in DEV BYPASS mode, all requests are trusted");
                Self::dev_bypass()
            }
            (false, Some(url)) => {
                let cache = KeyCache::new(
                    Arc::new(HttpKeySource::new(url)),
                    CachePolicy::from_config(config),
                );
                Self::new(cache, config.audience.clone(), config.issuer.clone())
            }
            (false, None) => {
                warn!("no jwks_url configured, every request will be refused");
                Self::new(
                    KeyCache::new(
                        Arc::new(StaticKeySource::new(JwkSet { keys: Vec::new() })),
                        CachePolicy::from_config(config),
                    ),
                    config.audience.clone(),
                    config.issuer.clone(),
                )
            }
        }
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self.mode, Mode::Bypass)
    }

    /// Verify a bearer token and return the identity it carries.
    pub async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let (keys, audience, issuer) = match &self.mode {
            Mode::Bypass => {
                return Ok(Identity {
                    subject: "dev".to_string(),
                    email: None,
                    expires_at: 0,
                });
            }
            Mode::Verify {
                keys,
                audience,
                issuer,
            } => (keys, audience, issuer),
        };

        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Unauthorized("missing token".into()))?;

        let header = jsonwebtoken::decode_header(token).map_err(classify)?;
        let kid = header.kid.as_deref();

        let mut set = keys.current().await?;
        if select_key(&set, kid).is_none() {
            // Possibly rotated since the last fetch.
            debug!(kid = ?kid, "unknown key id, forcing key refresh");
            if keys.force_refresh().await {
                set = keys.current().await?;
            }
        }
        let jwk = select_key(&set, kid)
            .ok_or_else(|| AuthError::Unauthorized("unknown signing key".into()))?;

        if let Some(expected) = &jwk.common.key_algorithm {
            if !algorithm_matches(expected, header.alg) {
                return Err(AuthError::Unauthorized(format!(
                    "algorithm {:?} not allowed for this key",
                    header.alg
                )));
            }
        }

        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| AuthError::Unauthorized(format!("unusable key: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.set_required_spec_claims(&["exp"]);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }

        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation).map_err(classify)?;
        let claims = data.claims;

        Ok(Identity {
            subject: claims
                .sub
                .or_else(|| claims.email.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            email: claims.email,
            expires_at: claims.exp,
        })
    }
}

/// Pick the verification key: by `kid`, or the only key when unnamed.
fn select_key<'a>(set: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => set.find(kid),
        None if set.keys.len() == 1 => set.keys.first(),
        None => None,
    }
}

fn algorithm_matches(key: &KeyAlgorithm, alg: Algorithm) -> bool {
    matches!(
        (key, alg),
        (KeyAlgorithm::HS256, Algorithm::HS256)
            | (KeyAlgorithm::HS384, Algorithm::HS384)
            | (KeyAlgorithm::HS512, Algorithm::HS512)
            | (KeyAlgorithm::ES256, Algorithm::ES256)
            | (KeyAlgorithm::ES384, Algorithm::ES384)
            | (KeyAlgorithm::RS256, Algorithm::RS256)
            | (KeyAlgorithm::RS384, Algorithm::RS384)
            | (KeyAlgorithm::RS512, Algorithm::RS512)
            | (KeyAlgorithm::PS256, Algorithm::PS256)
            | (KeyAlgorithm::PS384, Algorithm::PS384)
            | (KeyAlgorithm::PS512, Algorithm::PS512)
            | (KeyAlgorithm::EdDSA, Algorithm::EdDSA)
    )
}

fn classify(e: jsonwebtoken::errors::Error) -> AuthError {
    match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::MissingRequiredClaim(_) => AuthError::Malformed(e.to_string()),
        _ => AuthError::Unauthorized(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    const SECRET_A: &[u8] = b"first-signing-secret-0123456789ab";
    const SECRET_B: &[u8] = b"second-signing-secret-0123456789a";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn jwk_set(keys: &[(&str, &[u8])]) -> JwkSet {
        let keys: Vec<_> = keys
            .iter()
            .map(|(kid, secret)| {
                json!({
                    "kty": "oct",
                    "kid": kid,
                    "alg": "HS256",
                    "k": URL_SAFE_NO_PAD.encode(secret),
                })
            })
            .collect();
        serde_json::from_value(json!({ "keys": keys })).unwrap()
    }

    fn sign(kid: Option<&str>, secret: &[u8], claims: serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_string);
        jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn gate_with(source: Arc<StaticKeySource>, audience: Option<&str>) -> AccessGate {
        let policy = CachePolicy {
            ttl: Duration::from_secs(300),
            grace: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(1),
            min_refresh_interval: Duration::ZERO,
        };
        AccessGate::new(
            KeyCache::new(source, policy),
            audience.map(str::to_string),
            None,
        )
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let exp = now() + 600;
        let token = sign(
            Some("a"),
            SECRET_A,
            json!({ "sub": "user-1", "email": "u@example.com", "exp": exp }),
        );

        let identity = gate.verify(Some(&token)).await.unwrap();
        assert_eq!(identity.subject, "user-1");
        assert_eq!(identity.email.as_deref(), Some("u@example.com"));
        assert_eq!(identity.expires_at, exp);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        assert!(matches!(
            gate.verify(None).await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            gate.verify(Some("")).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn expired_token_is_expired() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let token = sign(Some("a"), SECRET_A, json!({ "sub": "u", "exp": now() - 3600 }));
        assert_eq!(gate.verify(Some(&token)).await, Err(AuthError::Expired));
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        for bad in ["not-a-jwt", "a.b.c", "e30.e30"] {
            assert!(
                matches!(gate.verify(Some(bad)).await, Err(AuthError::Malformed(_))),
                "{bad} should be malformed"
            );
        }
    }

    #[tokio::test]
    async fn missing_exp_is_malformed() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let token = sign(Some("a"), SECRET_A, json!({ "sub": "u" }));
        assert!(matches!(
            gate.verify(Some(&token)).await,
            Err(AuthError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn wrong_signature_is_unauthorized() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let token = sign(Some("a"), SECRET_B, json!({ "sub": "u", "exp": now() + 60 }));
        assert!(matches!(
            gate.verify(Some(&token)).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kid_refreshes_after_rotation() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source.clone(), None);

        // Warm the cache with the old set.
        let old = sign(Some("a"), SECRET_A, json!({ "sub": "u", "exp": now() + 60 }));
        gate.verify(Some(&old)).await.unwrap();

        source.replace(jwk_set(&[("a", SECRET_A), ("b", SECRET_B)])).await;
        let rotated = sign(Some("b"), SECRET_B, json!({ "sub": "v", "exp": now() + 60 }));
        assert_eq!(gate.verify(Some(&rotated)).await.unwrap().subject, "v");
    }

    #[tokio::test]
    async fn unknown_kid_without_rotation_is_unauthorized() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let token = sign(Some("zzz"), SECRET_A, json!({ "sub": "u", "exp": now() + 60 }));
        assert!(matches!(
            gate.verify(Some(&token)).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn single_key_used_when_kid_absent() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let token = sign(None, SECRET_A, json!({ "sub": "u", "exp": now() + 60 }));
        assert!(gate.verify(Some(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn audience_is_enforced_when_configured() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, Some("app-aud"));

        let good = sign(
            Some("a"),
            SECRET_A,
            json!({ "sub": "u", "aud": "app-aud", "exp": now() + 60 }),
        );
        assert!(gate.verify(Some(&good)).await.is_ok());

        let bad = sign(
            Some("a"),
            SECRET_A,
            json!({ "sub": "u", "aud": "other", "exp": now() + 60 }),
        );
        assert!(matches!(
            gate.verify(Some(&bad)).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn algorithm_pinned_by_key() {
        let source = Arc::new(StaticKeySource::new(jwk_set(&[("a", SECRET_A)])));
        let gate = gate_with(source, None);
        let mut header = Header::new(Algorithm::HS512);
        header.kid = Some("a".into());
        let token = jsonwebtoken::encode(
            &header,
            &json!({ "sub": "u", "exp": now() + 60 }),
            &EncodingKey::from_secret(SECRET_A),
        )
        .unwrap();
        assert!(matches!(
            gate.verify(Some(&token)).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn dev_bypass_accepts_anything() {
        let gate = AccessGate::dev_bypass();
        assert!(gate.is_bypass());
        assert_eq!(gate.verify(None).await.unwrap().subject, "dev");
    }

    #[test]
    fn from_config_defaults_to_verifying() {
        let config = AuthConfig {
            jwks_url: Some("https://keys.example.com/jwks".into()),
            ..AuthConfig::default()
        };
        assert!(!AccessGate::from_config(&config).is_bypass());

        let bypass = AuthConfig {
            dev_bypass: true,
            ..AuthConfig::default()
        };
        assert!(AccessGate::from_config(&bypass).is_bypass());
    }
}
