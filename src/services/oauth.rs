//! OAuth authorization flow
//!
//! The appview is a confidential client: `private_key_jwt` assertions signed
//! with the static ES256 key, PKCE on every authorization, and a fresh DPoP
//! key per session presented from the very first PAR call so the issued
//! tokens are bound to it.

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{AuthRequestData, CookieSession, DpopKeyPair, OAuthSessionData, TokenResponse};
use crate::services::crypto::{KeyStore, ACTIVE_KID};
use crate::services::identity::IdentityResolver;
use crate::services::jwt;
use crate::services::sessions::SessionStore;
use crate::services::ssrf;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub pushed_authorization_request_endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
    #[serde(default)]
    pub iss: Option<String>,
}

/// Result of a refresh-token grant.
pub struct RefreshOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: chrono::DateTime<Utc>,
    pub auth_server_nonce: Option<String>,
}

pub struct OAuthService {
    http: reqwest::Client,
    keys: Arc<KeyStore>,
    identity: Arc<dyn IdentityResolver>,
    store: Arc<SessionStore>,
    client_id: String,
    redirect_uri: String,
    scopes: Vec<String>,
    allow_insecure: bool,
}

fn random_token(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

fn pkce_challenge(verifier: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn oauth_error_code(body: &Value) -> Option<&str> {
    body.get("error").and_then(|e| e.as_str())
}

impl OAuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        keys: Arc<KeyStore>,
        identity: Arc<dyn IdentityResolver>,
        store: Arc<SessionStore>,
        client_id: String,
        redirect_uri: String,
        scopes: Vec<String>,
        allow_insecure: bool,
    ) -> Self {
        Self {
            http,
            keys,
            identity,
            store,
            client_id,
            redirect_uri,
            scopes,
            allow_insecure,
        }
    }

    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Locate the authorization server for a PDS and fetch its metadata.
    async fn discover(&self, pds_url: &str) -> AppResult<AuthServerMetadata> {
        ssrf::validate_remote_url(pds_url, self.allow_insecure)?;

        let resource_url = format!("{pds_url}/.well-known/oauth-protected-resource");
        let resource: Value = self
            .http
            .get(&resource_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::OAuth(format!("PDS resource metadata: {e}")))?
            .json()
            .await?;
        let issuer = resource
            .get("authorization_servers")
            .and_then(|v| v.as_array())
            .and_then(|v| v.first())
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::OAuth("PDS lists no authorization server".into()))?
            .trim_end_matches('/')
            .to_string();
        ssrf::validate_remote_url(&issuer, self.allow_insecure)?;

        let metadata_url = format!("{issuer}/.well-known/oauth-authorization-server");
        let metadata: AuthServerMetadata = self
            .http
            .get(&metadata_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::OAuth(format!("authorization server metadata: {e}")))?
            .json()
            .await?;
        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(AppError::OAuth("issuer mismatch in server metadata".into()));
        }
        Ok(metadata)
    }

    /// One POST against an OAuth endpoint with client assertion + DPoP,
    /// retrying exactly once when the server demands a nonce.
    async fn signed_post(
        &self,
        endpoint: &str,
        base_form: &[(&str, String)],
        dpop_key: &DpopKeyPair,
        issuer: &str,
        mut nonce: Option<String>,
    ) -> AppResult<(Value, Option<String>)> {
        for attempt in 0..2 {
            let assertion =
                jwt::client_assertion(ACTIVE_KID, &self.keys.signing_key(), &self.client_id, issuer)?;
            let proof = jwt::dpop_proof(dpop_key, "POST", endpoint, nonce.as_deref(), None)?;

            let mut form: Vec<(&str, String)> = base_form.to_vec();
            form.push(("client_id", self.client_id.clone()));
            form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
            form.push(("client_assertion", assertion));

            let response = self
                .http
                .post(endpoint)
                .header("DPoP", proof)
                .form(&form)
                .send()
                .await?;

            let status = response.status();
            let header_nonce = response
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body: Value = response.json().await.unwrap_or(Value::Null);

            if status.is_success() {
                return Ok((body, header_nonce.or(nonce)));
            }

            let error_code = oauth_error_code(&body).unwrap_or("");
            if error_code == "use_dpop_nonce" && attempt == 0 {
                if let Some(new_nonce) = header_nonce {
                    nonce = Some(new_nonce);
                    continue;
                }
            }

            if status.is_client_error() {
                tracing::warn!(endpoint, %status, error = error_code, "OAuth request rejected");
                if error_code == "invalid_grant" {
                    return Err(AppError::NotAuthenticated);
                }
                return Err(AppError::OAuth(format!(
                    "{error_code}: {}",
                    body.get("error_description")
                        .and_then(|d| d.as_str())
                        .unwrap_or("request rejected")
                )));
            }
            return Err(AppError::PdsTransport(format!(
                "{endpoint} returned {status}"
            )));
        }
        unreachable!("signed_post loops at most twice")
    }

    /// Start the flow: resolve the identifier, push the authorization
    /// request, persist the transient state, and hand back the URL to send
    /// the user to.
    pub async fn authorize(&self, identifier: &str) -> AppResult<String> {
        let who = self.identity.resolve_identifier(identifier).await?;
        let metadata = self.discover(&who.pds_url).await?;

        let state = random_token(32);
        let pkce_verifier = random_token(64);
        let dpop_key = DpopKeyPair::generate()?;

        let form = [
            ("response_type", "code".to_string()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("state", state.clone()),
            ("scope", self.scope()),
            ("code_challenge", pkce_challenge(&pkce_verifier)),
            ("code_challenge_method", "S256".to_string()),
            ("login_hint", who.did.clone()),
        ];
        let (body, nonce) = self
            .signed_post(
                &metadata.pushed_authorization_request_endpoint,
                &form,
                &dpop_key,
                &metadata.issuer,
                None,
            )
            .await?;
        let request_uri = body
            .get("request_uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::OAuth("PAR response missing request_uri".into()))?;

        self.store
            .save_auth_request(&AuthRequestData {
                state: state.clone(),
                pkce_verifier,
                dpop_private_key: dpop_key,
                auth_server_issuer: metadata.issuer.clone(),
                dpop_auth_server_nonce: nonce,
                token_endpoint: metadata.token_endpoint.clone(),
                did: who.did,
                handle: who.handle,
                pds_url: who.pds_url,
                created_at: Utc::now(),
            })
            .await?;

        let mut authorize_url = url::Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| AppError::OAuth(format!("bad authorization endpoint: {e}")))?;
        authorize_url
            .query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("request_uri", request_uri);
        Ok(authorize_url.to_string())
    }

    /// Finish the flow: consume the pending request, exchange the code, and
    /// persist the session.
    pub async fn callback(&self, params: CallbackParams) -> AppResult<(OAuthSessionData, CookieSession)> {
        let request = self.store.consume_auth_request(&params.state).await?;

        if let Some(iss) = &params.iss {
            if iss.trim_end_matches('/') != request.auth_server_issuer.trim_end_matches('/') {
                metrics::record_oauth_login(false);
                return Err(AppError::OAuth("issuer mismatch on callback".into()));
            }
        }

        let form = [
            ("grant_type", "authorization_code".to_string()),
            ("code", params.code.clone()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("code_verifier", request.pkce_verifier.clone()),
        ];
        let (body, nonce) = self
            .signed_post(
                &request.token_endpoint,
                &form,
                &request.dpop_private_key,
                &request.auth_server_issuer,
                request.dpop_auth_server_nonce.clone(),
            )
            .await
            .inspect_err(|_| metrics::record_oauth_login(false))?;

        let tokens: TokenResponse = serde_json::from_value(body)
            .map_err(|e| AppError::OAuth(format!("malformed token response: {e}")))?;
        if tokens.sub != request.did {
            metrics::record_oauth_login(false);
            return Err(AppError::OAuth(format!(
                "token issued for {} but authorization was for {}",
                tokens.sub, request.did
            )));
        }

        let session = OAuthSessionData {
            did: request.did.clone(),
            handle: request.handle.clone(),
            pds_url: request.pds_url.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
            token_expiry: Utc::now() + Duration::seconds(tokens.expires_in as i64),
            dpop_private_key: request.dpop_private_key,
            dpop_auth_server_nonce: nonce,
            dpop_pds_nonce: None,
            auth_server_issuer: request.auth_server_issuer,
            token_endpoint: request.token_endpoint,
            session_id: Uuid::new_v4(),
        };
        self.store.save_session(&session).await?;
        metrics::record_oauth_login(true);

        let cookie = CookieSession {
            did: session.did.clone(),
            handle: session.handle.clone(),
            pds_url: session.pds_url.clone(),
            session_id: session.session_id,
            authenticated: true,
        };
        Ok((session, cookie))
    }

    /// Run a refresh-token grant for an existing session.
    ///
    /// 4xx from the authorization server maps to `NotAuthenticated`;
    /// transport failures stay transient and leave the stored session alone.
    pub async fn refresh_grant(&self, session: &OAuthSessionData) -> AppResult<RefreshOutcome> {
        if session.refresh_token.is_empty() {
            return Err(AppError::NotAuthenticated);
        }
        let form = [(
            "grant_type",
            "refresh_token".to_string(),
        ), (
            "refresh_token",
            session.refresh_token.clone(),
        )];
        let result = self
            .signed_post(
                &session.token_endpoint,
                &form,
                &session.dpop_private_key,
                &session.auth_server_issuer,
                session.dpop_auth_server_nonce.clone(),
            )
            .await;
        let (body, nonce) = match result {
            Ok(ok) => ok,
            Err(AppError::OAuth(msg)) => {
                // Any 4xx on refresh means re-authentication.
                tracing::warn!(did = %session.did, "token refresh rejected: {msg}");
                return Err(AppError::NotAuthenticated);
            }
            Err(e) => return Err(e),
        };

        let tokens: TokenResponse = serde_json::from_value(body)
            .map_err(|e| AppError::OAuth(format!("malformed token response: {e}")))?;
        Ok(RefreshOutcome {
            access_token: tokens.access_token,
            refresh_token: tokens
                .refresh_token
                .unwrap_or_else(|| session.refresh_token.clone()),
            expiry: Utc::now() + Duration::seconds(tokens.expires_in as i64),
            auth_server_nonce: nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_verifier_is_within_rfc_bounds() {
        let verifier = random_token(64);
        assert!(verifier.len() >= 43 && verifier.len() <= 128, "{}", verifier.len());
        // URL-safe alphabet only.
        assert!(verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        // Test vector from RFC 7636 appendix B.
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn states_are_unique() {
        assert_ne!(random_token(32), random_token(32));
    }
}
