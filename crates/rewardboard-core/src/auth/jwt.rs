//! Unverified JWT payload decoding.
//!
//! The backend signs and verifies tokens; the client only peeks at the
//! claims to recover identity and expiry. Nothing here is a security check.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;

use crate::models::UserProfile;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub authorities: Vec<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Expired at `now` (seconds since the epoch)
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp < now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    /// Build a profile from the claims. `sub` must be the numeric user id.
    pub fn profile(&self) -> Option<UserProfile> {
        let id = self.sub.parse().ok()?;
        Some(UserProfile {
            id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
            authorities: self.authorities.clone(),
        })
    }
}

/// Decode the payload segment of `header.payload.signature`.
pub fn decode_claims(token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    // Some issuers pad the segment even though JWTs should not
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}
