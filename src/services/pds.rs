//! Authenticated PDS client
//!
//! Every call is signed with a fresh DPoP proof over the session's key and
//! presented with the `DPoP` token scheme. When the PDS rotates its nonce the
//! client retries the one request and persists the new nonce through the
//! session store.

use crate::error::{AppError, AppResult};
use crate::models::{AtUri, BlobRef, OAuthSessionData, Record};
use crate::services::jwt;
use crate::services::sessions::SessionStore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct PutRecordOutput {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetRecordOutput {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

pub struct PdsClient {
    http: reqwest::Client,
    /// Absent for detached clients, which keep nonces in memory only.
    store: Option<Arc<SessionStore>>,
    session: OAuthSessionData,
    pds_nonce: tokio::sync::Mutex<Option<String>>,
}

enum Body<'a> {
    None,
    Json(&'a Value),
    Raw(&'a [u8], &'a str),
}

impl PdsClient {
    pub fn new(
        http: reqwest::Client,
        store: Arc<SessionStore>,
        session: OAuthSessionData,
    ) -> Self {
        let nonce = session.dpop_pds_nonce.clone();
        Self {
            http,
            store: Some(store),
            session,
            pds_nonce: tokio::sync::Mutex::new(nonce),
        }
    }

    /// A client with no backing session store. Nonce rotations live only as
    /// long as the client.
    pub fn detached(http: reqwest::Client, session: OAuthSessionData) -> Self {
        let nonce = session.dpop_pds_nonce.clone();
        Self {
            http,
            store: None,
            session,
            pds_nonce: tokio::sync::Mutex::new(nonce),
        }
    }

    pub fn did(&self) -> &str {
        &self.session.did
    }

    pub fn handle(&self) -> &str {
        &self.session.handle
    }

    pub fn pds_url(&self) -> &str {
        &self.session.pds_url
    }

    fn xrpc_url(&self, nsid: &str) -> String {
        format!("{}/xrpc/{nsid}", self.session.pds_url)
    }

    async fn remember_nonce(&self, nonce: &str) {
        let mut held = self.pds_nonce.lock().await;
        if held.as_deref() == Some(nonce) {
            return;
        }
        *held = Some(nonce.to_string());
        drop(held);
        if let Some(store) = &self.store {
            if let Err(e) = store
                .update_pds_nonce(&self.session.did, &self.session.session_id, nonce.to_string())
                .await
            {
                tracing::warn!(did = %self.session.did, error = %e, "failed to persist PDS nonce");
            }
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        nsid: &str,
        query: Option<&[(&str, &str)]>,
        body: Body<'_>,
    ) -> AppResult<Value> {
        let url = self.xrpc_url(nsid);

        for attempt in 0..2 {
            let nonce = self.pds_nonce.lock().await.clone();
            let proof = jwt::dpop_proof(
                &self.session.dpop_private_key,
                method.as_str(),
                &url,
                nonce.as_deref(),
                Some(&self.session.access_token),
            )?;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(
                    reqwest::header::AUTHORIZATION,
                    format!("DPoP {}", self.session.access_token),
                )
                .header("DPoP", proof);
            if let Some(query) = query {
                request = request.query(query);
            }
            match &body {
                Body::None => {}
                Body::Json(value) => request = request.json(*value),
                Body::Raw(bytes, content_type) => {
                    request = request
                        .header(reqwest::header::CONTENT_TYPE, *content_type)
                        .body(bytes.to_vec());
                }
            }

            let response = request.send().await.map_err(|e| {
                AppError::PdsTransport(format!("{nsid}: {e}"))
            })?;
            let status = response.status();
            let header_nonce = response
                .headers()
                .get("DPoP-Nonce")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            if let Some(nonce) = &header_nonce {
                self.remember_nonce(nonce).await;
            }

            if status.is_success() {
                if status == reqwest::StatusCode::NO_CONTENT {
                    return Ok(Value::Null);
                }
                return Ok(response.json().await.unwrap_or(Value::Null));
            }

            let body_json: Value = response.json().await.unwrap_or(Value::Null);
            let error_code = body_json
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("");

            if error_code == "use_dpop_nonce" && attempt == 0 && header_nonce.is_some() {
                continue;
            }

            let message = body_json
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("request failed");
            tracing::warn!(nsid, %status, error = error_code, "PDS call failed");

            return Err(match (status.as_u16(), error_code) {
                (_, "InvalidSwap") => AppError::PdsConflict,
                (401, _) | (_, "ExpiredToken") | (_, "InvalidToken") => AppError::NotAuthenticated,
                (400..=499, _) => AppError::Validation(format!("{error_code}: {message}")),
                _ => AppError::PdsTransport(format!("{nsid} returned {status}")),
            });
        }
        unreachable!("PDS request loops at most twice")
    }

    async fn procedure(&self, nsid: &str, body: &Value) -> AppResult<Value> {
        self.request(reqwest::Method::POST, nsid, None, Body::Json(body))
            .await
    }

    async fn query(&self, nsid: &str, params: &[(&str, &str)]) -> AppResult<Value> {
        self.request(reqwest::Method::GET, nsid, Some(params), Body::None)
            .await
    }

    /// Put a record. `swap_cid` enables optimistic concurrency on updates: a
    /// mismatch surfaces as `PdsConflict`.
    pub async fn put_record(
        &self,
        collection: &str,
        rkey: &str,
        record: &Record,
        swap_cid: Option<&str>,
    ) -> AppResult<PutRecordOutput> {
        let mut body = json!({
            "repo": self.session.did,
            "collection": collection,
            "rkey": rkey,
            "record": record.to_value()?,
        });
        if let Some(cid) = swap_cid {
            body["swapRecord"] = Value::String(cid.to_string());
        }
        let value = self.procedure("com.atproto.repo.putRecord", &body).await?;
        Ok(serde_json::from_value(value)
            .map_err(|e| AppError::PdsTransport(format!("malformed putRecord response: {e}")))?)
    }

    pub async fn delete_record(&self, collection: &str, rkey: &str) -> AppResult<()> {
        let body = json!({
            "repo": self.session.did,
            "collection": collection,
            "rkey": rkey,
        });
        self.procedure("com.atproto.repo.deleteRecord", &body).await?;
        Ok(())
    }

    pub async fn delete_record_at(&self, uri: &AtUri) -> AppResult<()> {
        self.delete_record(&uri.collection, &uri.rkey).await
    }

    pub async fn get_record(&self, collection: &str, rkey: &str) -> AppResult<GetRecordOutput> {
        let did = self.session.did.clone();
        let value = self
            .query(
                "com.atproto.repo.getRecord",
                &[("repo", did.as_str()), ("collection", collection), ("rkey", rkey)],
            )
            .await?;
        Ok(serde_json::from_value(value)
            .map_err(|e| AppError::PdsTransport(format!("malformed getRecord response: {e}")))?)
    }

    /// Batched writes applied atomically on the PDS side.
    pub async fn apply_writes(&self, writes: Vec<Value>) -> AppResult<()> {
        let body = json!({
            "repo": self.session.did,
            "writes": writes,
        });
        self.procedure("com.atproto.repo.applyWrites", &body).await?;
        Ok(())
    }

    pub async fn upload_blob(&self, bytes: &[u8], content_type: &str) -> AppResult<BlobRef> {
        let value = self
            .request(
                reqwest::Method::POST,
                "com.atproto.repo.uploadBlob",
                None,
                Body::Raw(bytes, content_type),
            )
            .await?;
        let blob = value
            .get("blob")
            .cloned()
            .ok_or_else(|| AppError::PdsTransport("uploadBlob response missing blob".into()))?;
        Ok(serde_json::from_value(blob)
            .map_err(|e| AppError::PdsTransport(format!("malformed blob ref: {e}")))?)
    }

    /// Ask the PDS to mint a service token on the user's behalf.
    pub async fn get_service_auth(&self, aud: &str, lxm: &str, exp: i64) -> AppResult<String> {
        let exp_string = exp.to_string();
        let value = self
            .query(
                "com.atproto.server.getServiceAuth",
                &[("aud", aud), ("lxm", lxm), ("exp", exp_string.as_str())],
            )
            .await?;
        value
            .get("token")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| AppError::PdsTransport("getServiceAuth response missing token".into()))
    }
}
