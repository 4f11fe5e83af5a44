//! HMAC-SHA256 request signing.
//!
//! The realtime channel signs `"{timestamp_s}{key}"` with the API secret;
//! the REST side signs `"{timestamp_ms}{user_id}{key}"`. Signatures are
//! rendered as lowercase hex. Timestamps are integer seconds on the
//! realtime side and integer milliseconds on the REST side — the units
//! must not be swapped. A signed envelope is valid for roughly 20 seconds,
//! so signers produce a fresh one per call.

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac_hex(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signs authentication envelopes for the realtime channel.
#[derive(Clone)]
pub struct WsSigner {
    key: String,
    secret: String,
}

impl WsSigner {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        WsSigner { key: key.into(), secret: secret.into() }
    }

    /// The signature for an explicit timestamp (seconds since the epoch).
    pub fn signature_at(&self, timestamp: i64) -> String {
        hmac_hex(&self.secret, &format!("{timestamp}{}", self.key))
    }

    /// The full auth envelope for an explicit timestamp.
    pub fn envelope_at(&self, timestamp: i64) -> Value {
        json!({
            "e": "auth",
            "auth": {
                "key": self.key,
                "signature": self.signature_at(timestamp),
                "timestamp": timestamp,
            },
            "oid": "auth",
        })
    }

    /// A freshly timestamped auth envelope.
    pub fn envelope(&self) -> Value {
        self.envelope_at(chrono::Utc::now().timestamp())
    }
}

impl std::fmt::Debug for WsSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSigner")
            .field("key", &self.key)
            .field("secret", &"{***}")
            .finish()
    }
}

/// Signs request parameters for the REST helper.
#[derive(Clone)]
pub struct RestSigner {
    user_id: String,
    key: String,
    secret: String,
}

impl RestSigner {
    pub fn new(
        user_id: impl Into<String>,
        key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        RestSigner {
            user_id: user_id.into(),
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// Signed parameters for an explicit timestamp (milliseconds since the
    /// epoch); the timestamp doubles as the nonce.
    pub fn params_at(&self, timestamp_ms: i64) -> Value {
        let payload = format!("{timestamp_ms}{}{}", self.user_id, self.key);
        json!({
            "key": self.key,
            "signature": hmac_hex(&self.secret, &payload),
            "nonce": timestamp_ms,
        })
    }

    /// Freshly timestamped signed parameters.
    pub fn params(&self) -> Value {
        self.params_at(chrono::Utc::now().timestamp_millis())
    }
}

impl std::fmt::Debug for RestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSigner")
            .field("user_id", &self.user_id)
            .field("key", &self.key)
            .field("secret", &"{***}")
            .finish()
    }
}
