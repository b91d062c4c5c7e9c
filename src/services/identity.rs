//! Identity resolution
//!
//! DID -> (handle, PDS) and handle -> DID lookups. The resolver is a trait so
//! the read and write paths can be exercised against a canned implementation;
//! the HTTP implementation speaks to the PLC directory, did:web documents and
//! the handle's own domain.

use crate::error::{AppError, AppResult};
use crate::models::ResolvedIdentity;
use crate::validate;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const RESOLVE_CONCURRENCY: usize = 8;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a handle or DID to a full identity.
    async fn resolve_identifier(&self, identifier: &str) -> AppResult<ResolvedIdentity>;

    /// Resolve a DID to a full identity.
    async fn resolve_did(&self, did: &str) -> AppResult<ResolvedIdentity>;

    /// Best-effort batch DID -> handle resolution. Unresolvable DIDs are
    /// simply absent from the result.
    async fn resolve_handles(&self, dids: &[String]) -> HashMap<String, String>;
}

pub struct HttpIdentityResolver {
    http: reqwest::Client,
    plc_directory: String,
    cache: DashMap<String, (ResolvedIdentity, Instant)>,
    cache_ttl: Duration,
}

impl HttpIdentityResolver {
    pub fn new(http: reqwest::Client, plc_directory: String) -> Self {
        Self {
            http,
            plc_directory,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(600),
        }
    }

    fn cached(&self, did: &str) -> Option<ResolvedIdentity> {
        let entry = self.cache.get(did)?;
        let (identity, stored_at) = entry.value();
        if stored_at.elapsed() > self.cache_ttl {
            drop(entry);
            self.cache.remove(did);
            return None;
        }
        Some(identity.clone())
    }

    async fn fetch_did_document(&self, did: &str) -> AppResult<Value> {
        let url = if did.starts_with("did:plc:") {
            format!("{}/{}", self.plc_directory.trim_end_matches('/'), did)
        } else if let Some(host) = did.strip_prefix("did:web:") {
            format!("https://{host}/.well-known/did.json")
        } else {
            return Err(AppError::Validation(format!("unsupported DID method: {did}")));
        };

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::NotFound(format!("could not resolve {did}")));
        }
        Ok(response.json().await?)
    }

    async fn resolve_handle_to_did(&self, handle: &str) -> AppResult<String> {
        // The handle's own domain is authoritative.
        let url = format!("https://{handle}/.well-known/atproto-did");
        let response = self.http.get(&url).send().await;
        if let Ok(response) = response {
            if response.status().is_success() {
                if let Ok(text) = response.text().await {
                    let did = text.trim().to_string();
                    if validate::validate_did(&did).is_ok() {
                        return Ok(did);
                    }
                }
            }
        }
        Err(AppError::NotFound(format!("could not resolve handle {handle}")))
    }
}

fn identity_from_document(did: &str, doc: &Value) -> AppResult<ResolvedIdentity> {
    let handle = doc
        .get("alsoKnownAs")
        .and_then(|aka| aka.as_array())
        .and_then(|aka| aka.first())
        .and_then(|v| v.as_str())
        .and_then(|s| s.strip_prefix("at://"))
        .unwrap_or(did)
        .to_string();

    let pds_url = doc
        .get("service")
        .and_then(|s| s.as_array())
        .and_then(|services| {
            services.iter().find(|s| {
                s.get("type").and_then(|t| t.as_str()) == Some("AtprotoPersonalDataServer")
            })
        })
        .and_then(|s| s.get("serviceEndpoint"))
        .and_then(|e| e.as_str())
        .ok_or_else(|| AppError::NotFound(format!("no PDS registered for {did}")))?
        .trim_end_matches('/')
        .to_string();

    Ok(ResolvedIdentity {
        did: did.to_string(),
        handle,
        pds_url,
    })
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve_identifier(&self, identifier: &str) -> AppResult<ResolvedIdentity> {
        validate::validate_identifier(identifier)?;
        if identifier.starts_with("did:") {
            return self.resolve_did(identifier).await;
        }
        let handle = identifier.trim_start_matches('@');
        let did = self.resolve_handle_to_did(handle).await?;
        self.resolve_did(&did).await
    }

    async fn resolve_did(&self, did: &str) -> AppResult<ResolvedIdentity> {
        if let Some(identity) = self.cached(did) {
            return Ok(identity);
        }
        let doc = self.fetch_did_document(did).await?;
        let identity = identity_from_document(did, &doc)?;
        self.cache
            .insert(did.to_string(), (identity.clone(), Instant::now()));
        Ok(identity)
    }

    async fn resolve_handles(&self, dids: &[String]) -> HashMap<String, String> {
        let resolved: Vec<Option<(String, String)>> = stream::iter(dids.iter().cloned())
            .map(|did| async move {
                match self.resolve_did(&did).await {
                    Ok(identity) => Some((did, identity.handle)),
                    Err(e) => {
                        tracing::debug!(did = %did, error = %e, "handle resolution failed");
                        None
                    }
                }
            })
            .buffer_unordered(RESOLVE_CONCURRENCY)
            .collect()
            .await;
        resolved.into_iter().flatten().collect()
    }
}

/// Fixed-table resolver for tests.
pub struct StaticIdentityResolver {
    identities: HashMap<String, ResolvedIdentity>,
}

impl StaticIdentityResolver {
    pub fn new(identities: Vec<ResolvedIdentity>) -> Self {
        let identities = identities
            .into_iter()
            .map(|identity| (identity.did.clone(), identity))
            .collect();
        Self { identities }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve_identifier(&self, identifier: &str) -> AppResult<ResolvedIdentity> {
        if identifier.starts_with("did:") {
            return self.resolve_did(identifier).await;
        }
        self.identities
            .values()
            .find(|identity| identity.handle == identifier.trim_start_matches('@'))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("unknown identifier {identifier}")))
    }

    async fn resolve_did(&self, did: &str) -> AppResult<ResolvedIdentity> {
        self.identities
            .get(did)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("unknown DID {did}")))
    }

    async fn resolve_handles(&self, dids: &[String]) -> HashMap<String, String> {
        dids.iter()
            .filter_map(|did| {
                self.identities
                    .get(did)
                    .map(|identity| (did.clone(), identity.handle.clone()))
            })
            .collect()
    }
}
