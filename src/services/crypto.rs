//! Signing-key material
//!
//! Loads the appview's static ES256 key used for `private_key_jwt` client
//! authentication and publishes its public half via JWKS. Per-session DPoP
//! keys are generated fresh and never touch this store.

use crate::config::OAuthConfig;
use crate::error::{AppError, AppResult};
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use std::fs;

pub const ACTIVE_KID: &str = "appview-key-1";

/// The appview's client-authentication key.
#[derive(Clone)]
pub struct KeyStore {
    secret_key: SecretKey,
}

impl KeyStore {
    /// Load the ES256 key from configuration: a base64-encoded PEM takes
    /// precedence, then a filesystem path.
    pub fn from_config(oauth: &OAuthConfig) -> AppResult<Self> {
        let pem = if let Some(base64_pem) = &oauth.private_key_base64 {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(base64_pem)
                .map_err(|e| AppError::Config(format!("invalid base64 private key: {e}")))?;
            String::from_utf8(decoded)
                .map_err(|e| AppError::Config(format!("invalid PEM encoding: {e}")))?
        } else if let Some(path) = &oauth.private_key_path {
            fs::read_to_string(path)
                .map_err(|e| AppError::Config(format!("failed to read key {path}: {e}")))?
        } else {
            return Err(AppError::Config(
                "no OAuth private key configured (oauth.private_key_path or oauth.private_key_base64)"
                    .into(),
            ));
        };
        let secret_key = SecretKey::from_pkcs8_pem(&pem)
            .map_err(|e| AppError::Crypto(format!("failed to parse private key: {e}")))?;
        tracing::info!(kid = ACTIVE_KID, "loaded signing key");
        Ok(Self { secret_key })
    }

    /// An ephemeral store for tests and development.
    pub fn ephemeral() -> Self {
        Self {
            secret_key: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn signing_key(&self) -> p256::ecdsa::SigningKey {
        p256::ecdsa::SigningKey::from(&self.secret_key)
    }

    pub fn verifying_key(&self) -> p256::ecdsa::VerifyingKey {
        p256::ecdsa::VerifyingKey::from(&self.signing_key())
    }

    /// Public keys in JWK format for the JWKS endpoint.
    pub fn to_jwks(&self) -> serde_json::Value {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let public_key = self.secret_key.public_key();
        let point = public_key.to_encoded_point(false);
        let x = point.x().map(|bytes| b64.encode(bytes)).unwrap_or_default();
        let y = point.y().map(|bytes| b64.encode(bytes)).unwrap_or_default();
        serde_json::json!({
            "keys": [
                {
                    "kty": "EC",
                    "crv": "P-256",
                    "use": "sig",
                    "alg": "ES256",
                    "kid": ACTIVE_KID,
                    "x": x,
                    "y": y,
                }
            ]
        })
    }
}
