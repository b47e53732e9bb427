use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::clock::Clock;
use crate::server::models::UserRef;

type HmacSha256 = Hmac<Sha256>;

/// `{"alg":"HS256","typ":"JWT"}`
const JWT_HEADER: &str = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("cannot encode claims: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

/// Claims carried by an issued token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints and checks HS256 JWTs with a process-wide key
pub struct TokenIssuer {
    key: Vec<u8>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            ttl,
            clock,
        }
    }

    fn mac(&self) -> Result<HmacSha256, SigningError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| SigningError::InvalidKey(e.to_string()))
    }

    /// Issue a token for a user whose login session has succeeded
    pub fn issue(&self, user: &UserRef) -> Result<SignedToken, SigningError> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            user_id: user.user_id.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{}.{}", JWT_HEADER, payload);

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        tracing::debug!(user_id = %user.user_id, %expires_at, "Issued login token");

        Ok(SignedToken {
            value: format!("{}.{}", signing_input, signature),
            expires_at,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        if header != JWT_HEADER {
            return Err(TokenError::Malformed);
        }

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac().map_err(|_| TokenError::BadSignature)?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();

        let matches: bool = expected.as_slice().ct_eq(provided.as_slice()).into();
        if provided.len() != expected.len() || !matches {
            return Err(TokenError::BadSignature);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&raw).map_err(|_| TokenError::Malformed)?;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}
