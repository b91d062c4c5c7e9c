//! Session, OAuth and identity types
//!
//! The session substrate: what the store persists in Redis, what the signed
//! cookie carries, and the DPoP key material that binds tokens to this
//! process.

use crate::error::AppError;
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A parsed `at://<did>/<collection>/<rkey>` URI. The canonical primary key
/// for any federated record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(did: &str, collection: &str, rkey: &str) -> Self {
        Self {
            did: did.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        }
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| AppError::Validation(format!("not an at:// uri: {s}")))?;
        let mut parts = rest.splitn(3, '/');
        let did = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::Validation(format!("at-uri missing authority: {s}")))?;
        let collection = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| AppError::Validation(format!("at-uri missing collection: {s}")))?;
        let rkey = parts
            .next()
            .filter(|p| !p.is_empty() && !p.contains('/'))
            .ok_or_else(|| AppError::Validation(format!("at-uri missing rkey: {s}")))?;
        Ok(AtUri::new(did, collection, rkey))
    }
}

impl Serialize for AtUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AtUri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// DPoP key pair bound to one session (RFC 9449)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopKeyPair {
    /// The public key in JWK format (for the proof header)
    pub public_jwk: serde_json::Value,
    /// The private scalar (32 bytes for P-256)
    #[serde(with = "base64_bytes")]
    pub private_key_bytes: [u8; 32],
}

impl DpopKeyPair {
    /// Generate a fresh P-256 key pair for a new authorization.
    pub fn generate() -> Result<Self, AppError> {
        let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        let point = public.to_encoded_point(false);
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let x = point
            .x()
            .ok_or_else(|| AppError::Crypto("missing x coordinate".into()))?;
        let y = point
            .y()
            .ok_or_else(|| AppError::Crypto("missing y coordinate".into()))?;
        let public_jwk = serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": b64.encode(x.as_slice()),
            "y": b64.encode(y.as_slice()),
        });
        let private_key_bytes: [u8; 32] = secret
            .to_bytes()
            .as_slice()
            .try_into()
            .map_err(|_| AppError::Crypto("unexpected P-256 scalar length".into()))?;
        Ok(Self {
            public_jwk,
            private_key_bytes,
        })
    }

    pub fn signing_key(&self) -> Result<p256::ecdsa::SigningKey, AppError> {
        p256::ecdsa::SigningKey::from_bytes(&self.private_key_bytes.into())
            .map_err(|e| AppError::Crypto(format!("invalid DPoP key: {e}")))
    }

    /// JWK thumbprint (RFC 7638) of the public key.
    pub fn thumbprint(&self) -> Result<String, AppError> {
        let x = self.public_jwk.get("x").and_then(|v| v.as_str());
        let y = self.public_jwk.get("y").and_then(|v| v.as_str());
        let (x, y) = match (x, y) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(AppError::Crypto("DPoP public JWK missing coordinates".into())),
        };
        // Canonical form: lexicographically ordered required members.
        let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }
}

/// Serde helper for base64-encoded byte arrays
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        serializer.serialize_str(&b64.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let bytes = b64.decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid key length"))
    }
}

/// OAuth session persisted at `oauth:session:<did>:<session_id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSessionData {
    pub did: String,
    pub handle: String,
    pub pds_url: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub dpop_private_key: DpopKeyPair,
    pub dpop_auth_server_nonce: Option<String>,
    pub dpop_pds_nonce: Option<String>,
    pub auth_server_issuer: String,
    pub token_endpoint: String,
    pub session_id: Uuid,
}

/// Session metadata persisted at `oauth:session_meta:<did>:<session_id>`,
/// written together with the data key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transient OAuth authorization state, persisted at
/// `oauth:auth_request:<state>` and consumed exactly once on callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestData {
    pub state: String,
    pub pkce_verifier: String,
    pub dpop_private_key: DpopKeyPair,
    pub auth_server_issuer: String,
    pub dpop_auth_server_nonce: Option<String>,
    pub token_endpoint: String,
    pub did: String,
    pub handle: String,
    pub pds_url: String,
    pub created_at: DateTime<Utc>,
}

/// What the signed browser cookie carries. No tokens, ever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieSession {
    pub did: String,
    pub handle: String,
    pub pds_url: String,
    pub session_id: Uuid,
    pub authenticated: bool,
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[allow(dead_code)]
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    /// The DID of the authenticated user
    pub sub: String,
}

/// An identity resolved from a handle or DID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub did: String,
    pub handle: String,
    pub pds_url: String,
}
