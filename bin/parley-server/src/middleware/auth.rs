//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs carrying the numeric user id. REST handlers take an
//! [`AuthUser`] argument, which reads the `Authorization: Bearer` header; the
//! WebSocket route verifies its `access_token` query parameter directly.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    enabled: bool,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// An empty secret rejects every token.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
            enabled: !secret.is_empty(),
        }
    }

    /// Check the signature and expiry of `token` and return its user id.
    pub fn verify(&self, token: &str) -> Result<i64, ServerError> {
        if !self.enabled {
            return Err(ServerError::Unauthorized("authentication is not configured".into()));
        }
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims.user_id)
            .map_err(|e| {
                debug!(error = %e, "rejected bearer token");
                ServerError::Unauthorized("invalid or expired token".into())
            })
    }

    /// Sign a token for `user_id` that expires at `exp`.
    pub fn issue(&self, user_id: i64, exp: u64) -> Result<String, ServerError> {
        encode(&Header::new(Algorithm::HS256), &Claims { user_id, exp }, &self.encoding)
            .map_err(|e| ServerError::Internal(format!("failed to sign token: {e}")))
    }
}

/// The authenticated caller of a REST handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ServerError::Unauthorized("missing bearer token".into()))?;

        let user_id = state.auth.verify(token.trim())?;
        Ok(AuthUser { user_id })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn far_future() -> u64 {
        (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as u64
    }

    #[test]
    fn issued_token_round_trips() {
        let verifier = TokenVerifier::new("secret");
        let token = verifier.issue(7, far_future()).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), 7);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = TokenVerifier::new("secret").issue(7, far_future()).unwrap();
        let err = TokenVerifier::new("other").verify(&token).unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new("secret");
        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as u64;
        let token = verifier.issue(7, past).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let token = TokenVerifier::new("secret").issue(7, far_future()).unwrap();
        assert!(TokenVerifier::new("").verify(&token).is_err());
    }
}
