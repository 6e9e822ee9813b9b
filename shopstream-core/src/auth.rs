//! Access-token validation
//!
//! The application layer (checkout, dashboards) mints a signed credential
//! binding a user identity to a room id and a publish/subscribe capability.
//! This service validates that credential before a signaling channel is
//! accepted; it never issues tokens in production (the `issue` helper exists
//! for the application layer and tests, which share the secret).

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// What the credential allows the participant to do in the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Broadcaster: may produce and consume
    Publish,
    /// Viewer: may only consume
    Subscribe,
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "publish" => Ok(Self::Publish),
            "subscribe" => Ok(Self::Subscribe),
            other => Err(Error::Validation(format!("unknown capability: {other}"))),
        }
    }
}

/// Access-token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Tenant (merchant) the broadcast belongs to
    pub tenant: String,
    /// Room the credential is bound to
    pub room: String,
    /// Granted capability
    pub cap: Capability,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    #[must_use]
    pub const fn can_publish(&self) -> bool {
        matches!(self.cap, Capability::Publish)
    }
}

/// Validates (and, for the app layer and tests, issues) access tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

impl TokenService {
    #[must_use]
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Mint a token binding `user` to `room` with the given capability.
    pub fn issue(
        &self,
        user: impl Into<String>,
        tenant: impl Into<String>,
        room: impl Into<String>,
        cap: Capability,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.into(),
            tenant: tenant.into(),
            room: room.into(),
            cap,
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("failed to sign token: {e}")))
    }

    /// Validate a token and return its claims. The caller is responsible for
    /// checking that the claimed room matches the requested one.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthorized(format!("invalid token: {e}")))
    }

    /// Validate a token against the room the caller is trying to enter.
    pub fn verify_for_room(&self, token: &str, room: &str) -> Result<Claims> {
        let claims = self.verify(token)?;
        if claims.room != room {
            return Err(Error::Unauthorized(format!(
                "token is bound to room {}, not {room}",
                claims.room
            )));
        }
        Ok(claims)
    }
}
