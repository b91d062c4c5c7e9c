//! Compact ES256 JWS assembly
//!
//! Everything this appview signs is a small ES256 JWT: DPoP proofs
//! (RFC 9449) and `private_key_jwt` client assertions. The PDS mints service
//! tokens; none are signed here.

use crate::error::{AppError, AppResult};
use crate::models::DpopKeyPair;
use base64::Engine;
use chrono::Utc;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Sign `header`/`claims` into a compact JWS with ES256.
pub fn sign_es256(header: &Value, claims: &Value, key: &SigningKey) -> AppResult<String> {
    let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let encoded_header = b64url.encode(serde_json::to_string(header)?.as_bytes());
    let encoded_payload = b64url.encode(serde_json::to_string(claims)?.as_bytes());
    let signing_input = format!("{encoded_header}.{encoded_payload}");
    let signature: Signature = key.sign(signing_input.as_bytes());
    let encoded_signature = b64url.encode(signature.to_bytes());
    Ok(format!("{signing_input}.{encoded_signature}"))
}

/// The `htu` claim binds scheme, host and path; query and fragment are
/// excluded.
fn htu_for(url: &str) -> AppResult<String> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Internal(format!("invalid URL {url}: {e}")))?;
    Ok(format!(
        "{}{}",
        parsed.origin().ascii_serialization(),
        parsed.path()
    ))
}

/// Build a DPoP proof for one HTTP request.
///
/// `access_token` adds the `ath` hash claim when the proof accompanies a
/// token presentation; `nonce` echoes the server-issued DPoP nonce when one
/// is held.
pub fn dpop_proof(
    key: &DpopKeyPair,
    http_method: &str,
    http_url: &str,
    nonce: Option<&str>,
    access_token: Option<&str>,
) -> AppResult<String> {
    let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let header = json!({
        "typ": "dpop+jwt",
        "alg": "ES256",
        "jwk": key.public_jwk,
    });

    let mut claims = json!({
        "jti": Uuid::new_v4().to_string(),
        "htm": http_method.to_uppercase(),
        "htu": htu_for(http_url)?,
        "iat": Utc::now().timestamp(),
    });
    if let Some(nonce) = nonce {
        claims["nonce"] = Value::String(nonce.to_string());
    }
    if let Some(token) = access_token {
        let ath = b64url.encode(Sha256::digest(token.as_bytes()));
        claims["ath"] = Value::String(ath);
    }

    sign_es256(&header, &claims, &key.signing_key()?)
}

/// Build a `private_key_jwt` client assertion for the authorization server.
pub fn client_assertion(
    kid: &str,
    key: &SigningKey,
    client_id: &str,
    audience: &str,
) -> AppResult<String> {
    let now = Utc::now().timestamp();
    let header = json!({
        "alg": "ES256",
        "typ": "JWT",
        "kid": kid,
    });
    let claims = json!({
        "iss": client_id,
        "sub": client_id,
        "aud": audience,
        "jti": Uuid::new_v4().to_string(),
        "iat": now,
        "exp": now + 60,
    });
    sign_es256(&header, &claims, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;

    fn decode_part(part: &str) -> Value {
        let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        serde_json::from_slice(&b64url.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn dpop_proof_carries_bound_claims() {
        let pair = DpopKeyPair::generate().unwrap();
        let proof = dpop_proof(
            &pair,
            "post",
            "https://pds.example.com/xrpc/com.atproto.repo.putRecord?x=1",
            Some("server-nonce"),
            Some("an-access-token"),
        )
        .unwrap();

        let parts: Vec<&str> = proof.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = decode_part(parts[0]);
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["jwk"]["crv"], "P-256");
        assert!(header["jwk"].get("d").is_none());

        let claims = decode_part(parts[1]);
        assert_eq!(claims["htm"], "POST");
        // Query string must not leak into htu.
        assert_eq!(
            claims["htu"],
            "https://pds.example.com/xrpc/com.atproto.repo.putRecord"
        );
        assert_eq!(claims["nonce"], "server-nonce");
        let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let expected_ath = b64url.encode(Sha256::digest(b"an-access-token"));
        assert_eq!(claims["ath"], expected_ath);
    }

    #[test]
    fn htu_keeps_explicit_port() {
        assert_eq!(
            htu_for("http://127.0.0.1:3999/oauth/token?a=b").unwrap(),
            "http://127.0.0.1:3999/oauth/token"
        );
        assert_eq!(
            htu_for("https://pds.example.com/oauth/token").unwrap(),
            "https://pds.example.com/oauth/token"
        );
    }

    #[test]
    fn signature_verifies_with_the_public_key() {
        let pair = DpopKeyPair::generate().unwrap();
        let proof = dpop_proof(&pair, "GET", "https://x.example/a", None, None).unwrap();
        let (input, sig) = proof.rsplit_once('.').unwrap();
        let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let sig_bytes = b64url.decode(sig).unwrap();
        let signature = p256::ecdsa::Signature::from_slice(&sig_bytes).unwrap();
        let verifying = p256::ecdsa::VerifyingKey::from(&pair.signing_key().unwrap());
        verifying.verify(input.as_bytes(), &signature).unwrap();
    }

    #[test]
    fn client_assertion_claims() {
        let key = SigningKey::from(&p256::SecretKey::random(&mut rand::rngs::OsRng));
        let jwt = client_assertion(
            "appview-key-1",
            &key,
            "https://appview.example/client-metadata.json",
            "https://auth.example",
        )
        .unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        let claims = decode_part(parts[1]);
        assert_eq!(claims["iss"], claims["sub"]);
        assert_eq!(claims["aud"], "https://auth.example");
        assert!(claims["exp"].as_i64().unwrap() > claims["iat"].as_i64().unwrap());
    }
}
