//! Tamper-evident external references to blob identifiers.
//!
//! Token format: `base64url(json payload)` `--` `hex(HMAC-SHA256(payload part))`.
//! The payload carries the blob id, a purpose string, and an optional expiry.

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::defaults::{SIGNED_ID_PURPOSE, SIGNED_ID_SEPARATOR};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct SignedPayload {
    id: Uuid,
    purpose: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Encodes and verifies signed blob IDs.
#[derive(Clone)]
pub struct SignedIdCodec {
    mac: HmacSha256,
    default_ttl: Option<Duration>,
}

impl std::fmt::Debug for SignedIdCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedIdCodec")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}

impl SignedIdCodec {
    /// Create a codec keyed with `secret`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the secret is empty.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(Error::Config("signing secret must not be empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::Config(format!("invalid signing secret: {}", e)))?;
        Ok(Self {
            mac,
            default_ttl: None,
        })
    }

    /// Expire tokens produced by [`encode`](Self::encode) after `ttl`.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sign a blob id for the default purpose.
    pub fn encode(&self, blob_id: Uuid) -> String {
        self.encode_with(blob_id, SIGNED_ID_PURPOSE, self.default_ttl)
    }

    /// Sign a blob id for a specific purpose, optionally expiring.
    pub fn encode_with(&self, blob_id: Uuid, purpose: &str, expires_in: Option<Duration>) -> String {
        let expires_at = expires_in.map(|ttl| Utc::now() + ttl);
        let payload = serde_json::json!({
            "id": blob_id,
            "purpose": purpose,
            "expires_at": expires_at,
        });
        let data = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());
        let digest = self.digest(data.as_bytes());
        format!("{}{}{}", data, SIGNED_ID_SEPARATOR, digest)
    }

    /// Verify a default-purpose token and return the blob id it names.
    pub fn decode(&self, token: &str) -> Result<Uuid> {
        self.decode_for(token, SIGNED_ID_PURPOSE)
    }

    /// Verify a token issued for `purpose` and return the blob id it names.
    pub fn decode_for(&self, token: &str, purpose: &str) -> Result<Uuid> {
        let (data, digest) = token
            .rsplit_once(SIGNED_ID_SEPARATOR)
            .ok_or_else(|| Error::InvalidSignedId("missing digest".into()))?;
        if data.is_empty() || digest.is_empty() {
            return Err(Error::InvalidSignedId("empty segment".into()));
        }

        let signature =
            hex::decode(digest).map_err(|_| Error::InvalidSignedId("malformed digest".into()))?;
        let mut mac = self.mac.clone();
        mac.update(data.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| Error::InvalidSignedId("signature mismatch".into()))?;

        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|_| Error::InvalidSignedId("malformed payload".into()))?;
        let payload: SignedPayload = serde_json::from_slice(&raw)
            .map_err(|_| Error::InvalidSignedId("malformed payload".into()))?;

        if payload.purpose != purpose {
            return Err(Error::InvalidSignedId(format!(
                "issued for purpose {:?}",
                payload.purpose
            )));
        }
        if let Some(expires_at) = payload.expires_at {
            if expires_at <= Utc::now() {
                return Err(Error::InvalidSignedId("expired".into()));
            }
        }

        Ok(payload.id)
    }

    fn digest(&self, data: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }
}
