//! Identity verification for connection handshakes.

use crate::session::UserId;
use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use parley_protocol::SenderSummary;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("Missing credential")]
    MissingToken,

    /// The credential was rejected.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Verification did not finish in time.
    #[error("Identity verification timed out")]
    Timeout,
}

/// A verified identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: UserId,
    /// Remaining token claims.
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            claims: serde_json::Map::new(),
        }
    }

    /// Sender summary built from the `username`, `nickname` and `avatarUrl`
    /// claims.
    ///
    /// A missing username falls back to the user id, a missing nickname to
    /// the username.
    #[must_use]
    pub fn profile(&self) -> SenderSummary {
        let claim = |name: &str| {
            self.claims
                .get(name)
                .and_then(serde_json::Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let username = claim("username").unwrap_or_else(|| self.user_id.clone());
        SenderSummary {
            id: self.user_id.clone(),
            nickname: claim("nickname").unwrap_or_else(|| username.clone()),
            username,
            avatar_url: claim("avatarUrl"),
        }
    }
}

/// Validates a bearer credential and extracts the user it belongs to.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a token.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Strip an optional `Bearer ` prefix from an authorization value.
#[must_use]
pub fn bearer_token(value: &str) -> Option<&str> {
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// HS256 JWT verifier using a shared secret.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Validate a token synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the signature, expiry or
    /// subject is invalid.
    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }

        Ok(Identity {
            user_id: claims.sub,
            claims: claims.extra,
        })
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.validate(token)
    }
}
