//! Shared helpers for integration tests

#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use tangled_appview::index::Index;
use tangled_appview::models::{DpopKeyPair, OAuthSessionData, ResolvedIdentity};
use tangled_appview::rbac::{InMemoryPolicy, PolicyEngine};
use tangled_appview::services::{
    Cache, IdentityResolver, KnotClient, PdsClient, ServiceAuthMinter, StaticIdentityResolver,
};
use tangled_appview::write::WriteCoordinator;

pub const ALICE: &str = "did:plc:alice";
pub const BOB: &str = "did:plc:bob";

/// Strip the scheme from a wiremock URI so it can act as a bare knot host.
pub fn host_of(uri: &str) -> String {
    uri.trim_start_matches("http://").to_string()
}

pub fn test_session(did: &str, pds_url: &str) -> OAuthSessionData {
    OAuthSessionData {
        did: did.to_string(),
        handle: "alice.example.com".to_string(),
        pds_url: pds_url.trim_end_matches('/').to_string(),
        access_token: "test-access-token".to_string(),
        refresh_token: "test-refresh-token".to_string(),
        token_expiry: Utc::now() + Duration::hours(1),
        dpop_private_key: DpopKeyPair::generate().unwrap(),
        dpop_auth_server_nonce: None,
        dpop_pds_nonce: None,
        auth_server_issuer: "https://auth.example.com".to_string(),
        token_endpoint: "https://auth.example.com/oauth/token".to_string(),
        session_id: Uuid::new_v4(),
    }
}

pub fn pds_client(did: &str, pds_url: &str) -> PdsClient {
    PdsClient::detached(reqwest::Client::new(), test_session(did, pds_url))
}

pub fn identities() -> Arc<dyn IdentityResolver> {
    Arc::new(StaticIdentityResolver::new(vec![
        ResolvedIdentity {
            did: ALICE.to_string(),
            handle: "alice.example.com".to_string(),
            pds_url: "https://pds.example.com".to_string(),
        },
        ResolvedIdentity {
            did: BOB.to_string(),
            handle: "bob.example.com".to_string(),
            pds_url: "https://pds.example.com".to_string(),
        },
    ]))
}

pub fn knot_client() -> Arc<KnotClient> {
    Arc::new(
        KnotClient::new(
            StdDuration::from_secs(5),
            StdDuration::from_secs(2),
            true,
        )
        .unwrap(),
    )
}

pub fn coordinator(index: Index, policy: Arc<dyn PolicyEngine>) -> WriteCoordinator {
    WriteCoordinator::new(
        index,
        knot_client(),
        policy,
        ServiceAuthMinter::default(),
        identities(),
        true,
    )
}

pub fn in_memory_policy() -> Arc<dyn PolicyEngine> {
    Arc::new(InMemoryPolicy::new())
}

pub fn disabled_cache() -> Cache {
    Cache::disabled()
}
