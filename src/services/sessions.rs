//! Session store and authenticated-client vending
//!
//! Sessions live in Redis under two keys written together:
//! `oauth:session:<did>:<session_id>` (tokens and DPoP key) and
//! `oauth:session_meta:<did>:<session_id>` (created/updated timestamps).
//! Pending authorizations live under `oauth:auth_request:<state>` and are
//! consumed exactly once.
//!
//! A session is alive while both the inactivity and the absolute limit hold.
//! TTLs enforce that server-side; reads re-check `updated_at` to cover the
//! window where a TTL has not fired yet.

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{AuthRequestData, CookieSession, OAuthSessionData, SessionMeta};
use crate::services::oauth::OAuthService;
use crate::services::pds::PdsClient;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub inactivity: Duration,
    pub absolute: Duration,
    pub auth_request_secs: u64,
}

/// Outcome of a session lookup. `NotFound` and `Expired` both end in
/// re-authentication but are distinguished for callers and tests.
#[derive(Debug)]
pub enum SessionLookup {
    Found(OAuthSessionData, SessionMeta),
    NotFound,
    Expired,
}

#[derive(Clone)]
pub struct SessionStore {
    redis: redis::aio::ConnectionManager,
    limits: SessionLimits,
}

fn auth_request_key(state: &str) -> String {
    format!("oauth:auth_request:{state}")
}

fn session_key(did: &str, session_id: &Uuid) -> String {
    format!("oauth:session:{did}:{session_id}")
}

fn session_meta_key(did: &str, session_id: &Uuid) -> String {
    format!("oauth:session_meta:{did}:{session_id}")
}

/// `min(inactivity, absolute − (now − created_at))`, in whole seconds.
/// Non-positive means the absolute limit has already passed.
pub fn session_ttl_seconds(
    limits: &SessionLimits,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let remaining_absolute = limits.absolute - (now - created_at);
    limits
        .inactivity
        .min(remaining_absolute)
        .num_seconds()
}

/// The read-side liveness check backing the TTL.
pub fn is_session_expired(limits: &SessionLimits, meta: &SessionMeta, now: DateTime<Utc>) -> bool {
    now - meta.updated_at > limits.inactivity || now - meta.created_at > limits.absolute
}

impl SessionStore {
    pub fn new(redis: redis::aio::ConnectionManager, limits: SessionLimits) -> Self {
        Self { redis, limits }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Persist a pending authorization. Saving the same state twice within
    /// its TTL is an error: state values are single-use by construction.
    pub async fn save_auth_request(&self, request: &AuthRequestData) -> AppResult<()> {
        let key = auth_request_key(&request.state);
        let json = serde_json::to_string(request)?;
        let mut conn = self.redis.clone();
        let stored: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.limits.auth_request_secs)
            .query_async(&mut conn)
            .await?;
        if stored.is_none() {
            return Err(AppError::AlreadyExists(
                "authorization request already pending".into(),
            ));
        }
        Ok(())
    }

    /// Atomically fetch-and-delete a pending authorization, so a state value
    /// can be redeemed at most once.
    pub async fn consume_auth_request(&self, state: &str) -> AppResult<AuthRequestData> {
        let key = auth_request_key(state);
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        let raw = raw.ok_or_else(|| {
            AppError::OAuth("unknown or expired authorization request".into())
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write both session keys. An existing session keeps its `created_at`;
    /// `updated_at` always moves to now.
    pub async fn save_session(&self, data: &OAuthSessionData) -> AppResult<()> {
        let now = Utc::now();
        let data_key = session_key(&data.did, &data.session_id);
        let meta_key = session_meta_key(&data.did, &data.session_id);
        let mut conn = self.redis.clone();

        let existing_meta: Option<String> = conn.get(&meta_key).await?;
        let created_at = existing_meta
            .and_then(|raw| serde_json::from_str::<SessionMeta>(&raw).ok())
            .map(|meta| meta.created_at)
            .unwrap_or(now);

        let meta = SessionMeta {
            created_at,
            updated_at: now,
        };
        let ttl = session_ttl_seconds(&self.limits, created_at, now);
        if ttl <= 0 {
            self.delete_session(&data.did, &data.session_id).await?;
            return Err(AppError::NotAuthenticated);
        }

        redis::pipe()
            .atomic()
            .set_ex(&data_key, serde_json::to_string(data)?, ttl as u64)
            .ignore()
            .set_ex(&meta_key, serde_json::to_string(&meta)?, ttl as u64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn load_session(&self, did: &str, session_id: &Uuid) -> AppResult<SessionLookup> {
        let data_key = session_key(did, session_id);
        let meta_key = session_meta_key(did, session_id);
        let mut conn = self.redis.clone();

        let (raw_data, raw_meta): (Option<String>, Option<String>) = redis::pipe()
            .get(&data_key)
            .get(&meta_key)
            .query_async(&mut conn)
            .await?;

        let (raw_data, raw_meta) = match (raw_data, raw_meta) {
            (Some(d), Some(m)) => (d, m),
            _ => return Ok(SessionLookup::NotFound),
        };

        let data: OAuthSessionData = serde_json::from_str(&raw_data)?;
        let meta: SessionMeta = serde_json::from_str(&raw_meta)?;

        if is_session_expired(&self.limits, &meta, Utc::now()) {
            // The TTL race: the limit passed but the keys still exist.
            tracing::debug!(did, %session_id, "session past its limit, deleting");
            self.delete_session(did, session_id).await?;
            return Ok(SessionLookup::Expired);
        }
        Ok(SessionLookup::Found(data, meta))
    }

    /// Like `load_session` but collapses both miss kinds into
    /// `NotAuthenticated` for request paths.
    pub async fn get_session(
        &self,
        did: &str,
        session_id: &Uuid,
    ) -> AppResult<(OAuthSessionData, SessionMeta)> {
        match self.load_session(did, session_id).await? {
            SessionLookup::Found(data, meta) => Ok((data, meta)),
            SessionLookup::NotFound | SessionLookup::Expired => Err(AppError::NotAuthenticated),
        }
    }

    pub async fn delete_session(&self, did: &str, session_id: &Uuid) -> AppResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(vec![
            session_key(did, session_id),
            session_meta_key(did, session_id),
        ])
        .await?;
        Ok(())
    }

    /// Swap in a fresh token set after a refresh. Token expiry is monotonic
    /// within a session's lifetime.
    pub async fn refresh_session(
        &self,
        did: &str,
        session_id: &Uuid,
        access_token: String,
        refresh_token: String,
        expiry: DateTime<Utc>,
    ) -> AppResult<()> {
        let (mut data, _) = self.get_session(did, session_id).await?;
        data.access_token = access_token;
        data.refresh_token = refresh_token;
        data.token_expiry = expiry.max(data.token_expiry);
        self.save_session(&data).await
    }

    /// Persist a rotated PDS DPoP nonce.
    pub async fn update_pds_nonce(
        &self,
        did: &str,
        session_id: &Uuid,
        nonce: String,
    ) -> AppResult<()> {
        let (mut data, _) = self.get_session(did, session_id).await?;
        data.dpop_pds_nonce = Some(nonce);
        self.save_session(&data).await
    }

    /// Persist a rotated authorization-server DPoP nonce.
    pub async fn update_auth_server_nonce(
        &self,
        did: &str,
        session_id: &Uuid,
        nonce: String,
    ) -> AppResult<()> {
        let (mut data, _) = self.get_session(did, session_id).await?;
        data.dpop_auth_server_nonce = Some(nonce);
        self.save_session(&data).await
    }
}

/// Vends authenticated PDS clients, refreshing tokens as they near expiry.
pub struct SessionService {
    store: Arc<SessionStore>,
    oauth: Arc<OAuthService>,
    http: reqwest::Client,
    refresh_window: Duration,
    refresh_flights: DashMap<(String, Uuid), Arc<tokio::sync::Mutex<()>>>,
}

impl SessionService {
    pub fn new(
        store: Arc<SessionStore>,
        oauth: Arc<OAuthService>,
        http: reqwest::Client,
        refresh_window: Duration,
    ) -> Self {
        Self {
            store,
            oauth,
            http,
            refresh_window,
            refresh_flights: DashMap::new(),
        }
    }

    fn needs_refresh(&self, data: &OAuthSessionData) -> bool {
        data.token_expiry - Utc::now() <= self.refresh_window
    }

    /// Resolve the cookie to a live session and return a client that signs
    /// every PDS call with a fresh DPoP proof.
    ///
    /// Refresh is single-flighted per `(did, session_id)`: when many request
    /// tasks notice the near-expiry window at once, exactly one token update
    /// hits the authorization server.
    pub async fn authorized_client(&self, cookie: &CookieSession) -> AppResult<PdsClient> {
        if !cookie.authenticated {
            return Err(AppError::NotAuthenticated);
        }
        let (mut data, _) = self.store.get_session(&cookie.did, &cookie.session_id).await?;

        if self.needs_refresh(&data) {
            let key = (cookie.did.clone(), cookie.session_id);
            let flight = self
                .refresh_flights
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            {
                let _guard = flight.lock().await;
                // Another task may have refreshed while we waited.
                let (fresh, _) = self.store.get_session(&cookie.did, &cookie.session_id).await?;
                data = fresh;
                if self.needs_refresh(&data) {
                    match self.oauth.refresh_grant(&data).await {
                        Ok(outcome) => {
                            self.store
                                .refresh_session(
                                    &data.did,
                                    &data.session_id,
                                    outcome.access_token.clone(),
                                    outcome.refresh_token.clone(),
                                    outcome.expiry,
                                )
                                .await?;
                            if let Some(nonce) = &outcome.auth_server_nonce {
                                self.store
                                    .update_auth_server_nonce(
                                        &data.did,
                                        &data.session_id,
                                        nonce.clone(),
                                    )
                                    .await?;
                                data.dpop_auth_server_nonce = Some(nonce.clone());
                            }
                            data.access_token = outcome.access_token;
                            data.refresh_token = outcome.refresh_token;
                            data.token_expiry = outcome.expiry.max(data.token_expiry);
                            metrics::record_token_refresh(true);
                        }
                        Err(e) => {
                            metrics::record_token_refresh(false);
                            if matches!(e, AppError::NotAuthenticated) {
                                // Refresh token rejected: the stored session
                                // is dead for good.
                                let _ = self
                                    .store
                                    .delete_session(&data.did, &data.session_id)
                                    .await;
                            }
                            return Err(e);
                        }
                    }
                }
            }
            self.refresh_flights.remove(&key);
        }

        Ok(PdsClient::new(self.http.clone(), self.store.clone(), data))
    }

    pub async fn sign_out(&self, cookie: &CookieSession) -> AppResult<()> {
        self.store
            .delete_session(&cookie.did, &cookie.session_id)
            .await
    }
}
