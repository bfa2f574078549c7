//! Auth & Session Factory, §4.5.
//!
//! Resolves a bearer token presented in an `Auth` frame to a user identity
//! and [`Plan`], in the fixed four-step order the protocol promises
//! agents: a persisted API token, then a JWT, then a static token list,
//! then anonymous access. Also handles `JoinSession`: admitting a second
//! (or third, ...) control connection as a data session on an already
//! authenticated client.

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::persistence::ApiTokenRepo;
use crate::plan::{ApiTokenRecord, Plan};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A primary session may accept at most this many additional data-session
/// joins.
pub const MAX_DATA_SESSIONS: usize = 32;

/// How long an agent has to send its first `Auth` frame before the
/// control connection is dropped.
pub const AUTH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub user_id: String,
    pub plan: Plan,
    pub token_record: Option<ApiTokenRecord>,
}

/// Resolves `token` to an identity, trying each mechanism the protocol
/// promises in order. The first mechanism whose preconditions are met
/// wins — an API-token repo miss falls through to JWT, a JWT decode
/// failure falls through to the static list, and so on. Only a positively
/// *invalid* credential (wrong JWT signature, token not on any list, with
/// `auth.enabled = true`) returns `Err`; with `auth.enabled = false` every
/// token is accepted anonymously.
pub async fn resolve_token(
    token: &str,
    config: &AuthConfig,
    token_repo: Option<&(dyn ApiTokenRepo)>,
) -> Result<AuthOutcome, AuthError> {
    if !config.enabled {
        return Ok(anonymous_outcome());
    }

    // 1. Persisted API token, looked up by SHA-256 hash.
    if let Some(repo) = token_repo {
        let hash = hex::encode(Sha256::digest(token.as_bytes()));
        if let Some(record) = repo.find_by_hash(&hash).await {
            return Ok(AuthOutcome {
                user_id: record.user_id.clone(),
                plan: record.plan.clone(),
                token_record: Some(record),
            });
        }
    }

    // 2. JWT, if a verification secret is configured and the token looks
    // like one (three dot-separated segments). An expired token is a
    // fatal rejection; every other JWT failure falls through to step 3.
    if let Some(secret) = &config.jwt_secret {
        if token.matches('.').count() == 2 {
            match decode_jwt(token, secret) {
                Ok(claims) => {
                    return Ok(AuthOutcome {
                        user_id: claims.sub,
                        plan: Plan::anonymous(),
                        token_record: None,
                    });
                }
                Err(e) => {
                    if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) {
                        return Err(AuthError::TokenExpired);
                    }
                }
            }
        }
    }

    // 3. Static token list.
    if let Some(user_id) = config.static_tokens.get(token) {
        return Ok(AuthOutcome {
            user_id: user_id.to_string(),
            plan: Plan::anonymous(),
            token_record: None,
        });
    }

    // 4. Anonymous, unless the operator requires a recognized credential.
    if config.static_tokens.is_empty() && config.jwt_secret.is_none() {
        return Ok(anonymous_outcome());
    }
    Err(AuthError::InvalidToken)
}

fn anonymous_outcome() -> AuthOutcome {
    AuthOutcome { user_id: "anonymous".to_string(), plan: Plan::anonymous(), token_record: None }
}

#[derive(serde::Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

fn decode_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let key = jsonwebtoken::DecodingKey::from_secret(secret.as_bytes());
    let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(token, &key, &validation).map(|data| data.claims)
}

/// 32 random bytes, hex-encoded: handed to an agent in `AuthResult` and
/// required back, byte-for-byte, on every `JoinSession`.
pub fn generate_session_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison: session secrets gate data-session admission
/// and must not leak timing information about how many leading bytes
/// matched.
pub fn verify_session_secret(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryApiTokenRepo;

    fn config() -> AuthConfig {
        AuthConfig { enabled: true, static_tokens: Default::default(), jwt_secret: None }
    }

    #[tokio::test]
    async fn disabled_auth_is_always_anonymous() {
        let outcome = resolve_token("anything", &AuthConfig::default(), None).await.unwrap();
        assert_eq!(outcome.user_id, "anonymous");
    }

    #[tokio::test]
    async fn no_credentials_configured_falls_back_to_anonymous() {
        let outcome = resolve_token("anything", &config(), None).await.unwrap();
        assert_eq!(outcome.user_id, "anonymous");
    }

    #[tokio::test]
    async fn static_token_resolves_to_configured_user() {
        let mut cfg = config();
        cfg.static_tokens.insert("s3cr3t".to_string(), 42);
        let outcome = resolve_token("s3cr3t", &cfg, None).await.unwrap();
        assert_eq!(outcome.user_id, "42");
    }

    #[tokio::test]
    async fn unknown_token_rejected_when_credentials_are_required() {
        let mut cfg = config();
        cfg.static_tokens.insert("s3cr3t".to_string(), 42);
        let err = resolve_token("wrong", &cfg, None).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn api_token_repo_takes_priority_over_static_list() {
        let repo = InMemoryApiTokenRepo::new();
        let hash = hex::encode(Sha256::digest(b"db-token"));
        repo.insert(ApiTokenRecord {
            token_hash: hash,
            user_id: "db-user".to_string(),
            plan: Plan::anonymous(),
            allowed_subdomain_patterns: vec![],
            allowed_ips: vec![],
        });
        let mut cfg = config();
        cfg.static_tokens.insert("db-token".to_string(), 1);
        let outcome = resolve_token("db-token", &cfg, Some(&repo)).await.unwrap();
        assert_eq!(outcome.user_id, "db-user");
    }

    #[test]
    fn session_secret_verification_is_exact() {
        let secret = generate_session_secret();
        assert!(verify_session_secret(&secret, &secret));
        assert!(!verify_session_secret(&secret, "wrong"));
    }
}
