//! Session store integration tests
//!
//! These need a running Redis (localhost:6379) and are ignored by default;
//! the TTL and expiry arithmetic is covered by unit tests without it.

mod common;

use chrono::Duration;
use uuid::Uuid;

use tangled_appview::error::AppError;
use tangled_appview::models::{AuthRequestData, DpopKeyPair};
use tangled_appview::services::{SessionLimits, SessionLookup, SessionStore};

async fn store() -> SessionStore {
    let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
    let conn = redis::aio::ConnectionManager::new(client).await.unwrap();
    SessionStore::new(
        conn,
        SessionLimits {
            inactivity: Duration::days(14),
            absolute: Duration::days(60),
            auth_request_secs: 600,
        },
    )
}

fn auth_request(state: &str) -> AuthRequestData {
    AuthRequestData {
        state: state.to_string(),
        pkce_verifier: "verifier".into(),
        dpop_private_key: DpopKeyPair::generate().unwrap(),
        auth_server_issuer: "https://auth.example.com".into(),
        dpop_auth_server_nonce: None,
        token_endpoint: "https://auth.example.com/oauth/token".into(),
        did: common::ALICE.into(),
        handle: "alice.example.com".into(),
        pds_url: "https://pds.example.com".into(),
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn auth_requests_are_single_use() {
    let store = store().await;
    let state = format!("state-{}", Uuid::new_v4());

    store.save_auth_request(&auth_request(&state)).await.unwrap();

    // A second save under the same state is an error.
    let err = store.save_auth_request(&auth_request(&state)).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));

    // Exactly one consume succeeds.
    store.consume_auth_request(&state).await.unwrap();
    assert!(store.consume_auth_request(&state).await.is_err());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn sessions_round_trip_and_refresh() {
    let store = store().await;
    let session = common::test_session(common::ALICE, "https://pds.example.com");
    store.save_session(&session).await.unwrap();

    let (data, meta) = store
        .get_session(&session.did, &session.session_id)
        .await
        .unwrap();
    assert_eq!(data.access_token, "test-access-token");
    assert_eq!(meta.created_at, meta.updated_at);

    let new_expiry = chrono::Utc::now() + Duration::hours(2);
    store
        .refresh_session(
            &session.did,
            &session.session_id,
            "new-access".into(),
            "new-refresh".into(),
            new_expiry,
        )
        .await
        .unwrap();
    let (data, meta) = store
        .get_session(&session.did, &session.session_id)
        .await
        .unwrap();
    assert_eq!(data.access_token, "new-access");
    // Expiry is monotonic and updated_at moved forward.
    assert!(data.token_expiry >= new_expiry - Duration::seconds(1));
    assert!(meta.updated_at >= meta.created_at);

    store
        .delete_session(&session.did, &session.session_id)
        .await
        .unwrap();
    assert!(matches!(
        store
            .load_session(&session.did, &session.session_id)
            .await
            .unwrap(),
        SessionLookup::NotFound
    ));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn pds_nonce_rotation_persists() {
    let store = store().await;
    let session = common::test_session(common::ALICE, "https://pds.example.com");
    store.save_session(&session).await.unwrap();

    store
        .update_pds_nonce(&session.did, &session.session_id, "nonce-1".into())
        .await
        .unwrap();
    let (data, _) = store
        .get_session(&session.did, &session.session_id)
        .await
        .unwrap();
    assert_eq!(data.dpop_pds_nonce.as_deref(), Some("nonce-1"));

    store
        .delete_session(&session.did, &session.session_id)
        .await
        .unwrap();
}
