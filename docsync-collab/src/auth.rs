//! Bearer token verification.
//!
//! Tokens are HS256 JWTs minted by the platform's token service. They bind a
//! user to one document with one role; a token for another document is
//! rejected even when its signature is valid.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Access level granted by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Receives sync and awareness, cannot change content.
    Reader,
    Editor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => f.write_str("reader"),
            Role::Editor => f.write_str("editor"),
        }
    }
}

/// JWT claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Document the token is valid for
    pub doc: String,
    pub role: Role,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    pub iat: u64,
}

/// A verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user: String,
    pub document: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature mismatch")]
    SignatureMismatch,
    #[error("token is for document '{granted}', not '{requested}'")]
    DocumentMismatch { granted: String, requested: String },
    #[error("failed to sign token: {0}")]
    Signing(String),
}

pub struct AuthGate {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        // No grace period past `exp`.
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify `token` and check that it grants access to `requested_document`.
    pub fn verify(&self, token: &str, requested_document: &str) -> Result<Grant, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::SignatureMismatch,
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;
        let claims = data.claims;

        if claims.doc != requested_document {
            return Err(AuthError::DocumentMismatch {
                granted: claims.doc,
                requested: requested_document.to_string(),
            });
        }

        Ok(Grant {
            user: claims.sub,
            document: claims.doc,
            role: claims.role,
        })
    }

    /// Mint a token valid for `ttl`.
    pub fn issue(
        &self,
        user: &str,
        document: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = unix_now();
        self.sign(&Claims {
            sub: user.to_string(),
            doc: document.to_string(),
            role,
            exp: now + ttl.as_secs(),
            iat: now,
        })
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
