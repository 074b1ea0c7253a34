//! Signed OAuth state tokens.
//!
//! The state carries authorization-flow context (tenant, return URL, nonce)
//! across the provider redirect as an HS256-signed JWT. Signature and expiry
//! are checked here; single use is enforced separately by consuming the
//! nonce through a [`crate::nonce::NonceStore`].

use anyhow::Result;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

pub const STATE_TTL: Duration = Duration::minutes(10);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StateClaims {
    /// Tenant account starting the authorization.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    /// Single-use nonce; consumed exactly once on callback.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl StateClaims {
    pub fn new(tenant_id: impl Into<String>, return_url: Option<String>, ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        let jti: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self {
            sub: tenant_id.into(),
            return_url,
            jti,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        }
    }
}

/// Signs the claims into the opaque `state` query value.
pub fn sign_state(claims: &StateClaims, secret: &str) -> Result<String> {
    let header = Header::new(Algorithm::HS256);
    Ok(encode(
        &header,
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Verifies signature and expiry; a forged or expired token is an error.
pub fn verify_state(token: &str, secret: &str) -> Result<StateClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    Ok(decode::<StateClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?
    .claims)
}
