//! Bearer-token authentication for inbound channels.
//!
//! Tokens are HMAC-SHA256 signed: `base64(claims_json) + "." + base64(mac)`.
//! Identity is extracted once at connection time and never revalidated per
//! message. Access and refresh tokens use distinct secrets so a leaked
//! refresh secret cannot mint access tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{DispatchError, Result};
use crate::ids::UserId;

type HmacSha256 = Hmac<Sha256>;

/// What a token holder is allowed to do. Drivers and riders speak over
/// bidirectional channels; admin tokens only reach the operational HTTP
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Rider,
    Admin,
}

/// Signed token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user id.
    pub sub: UserId,
    pub role: Role,
    /// Expiry, milliseconds since the Unix epoch.
    pub exp: u64,
}

/// Signs and verifies bearer tokens with a fixed secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }

    /// Issue a signed token for the given claims.
    pub fn issue(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).expect("claims serialize");
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{encoded}.{sig}")
    }

    /// Verify signature and expiry, returning the embedded claims.
    pub fn verify(&self, token: &str, now_ms: u64) -> Result<Claims> {
        let (encoded, sig) = token
            .split_once('.')
            .ok_or_else(|| DispatchError::AuthFailed("malformed token".into()))?;

        let expected = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| DispatchError::AuthFailed("malformed signature".into()))?;
        let mut mac = self.mac();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| DispatchError::AuthFailed("signature mismatch".into()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| DispatchError::AuthFailed("malformed payload".into()))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|_| DispatchError::AuthFailed("malformed claims".into()))?;

        if claims.exp <= now_ms {
            return Err(DispatchError::AuthFailed("token expired".into()));
        }
        Ok(claims)
    }
}
