//! OAuth flow handlers and client metadata documents

use axum::{
    body::Body,
    extract::{Query, State},
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use axum_extra::extract::cookie::SignedCookieJar;
use serde::Deserialize;
use serde_json::json;

use crate::config::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::{build_session_cookie, clear_session_cookie};
use crate::models::CookieSession;
use crate::services::CallbackParams;

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub identifier: String,
}

fn redirect(location: &str) -> AppResult<Response> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header("Location", location)
        .body(Body::empty())
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// GET /oauth/login?identifier=alice.example.com
///
/// Starts the authorization flow and redirects to the user's authorization
/// server.
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> AppResult<Response> {
    tracing::info!(identifier = %query.identifier, "login requested");
    let authorize_url = state.oauth.authorize(&query.identifier).await?;
    redirect(&authorize_url)
}

/// GET /oauth/callback?code=...&state=...&iss=...
pub async fn callback(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Query(params): Query<CallbackParams>,
) -> AppResult<(SignedCookieJar, Response)> {
    let (_session, cookie_session) = state.oauth.callback(params).await?;
    let cookie = build_session_cookie(&state, &cookie_session)?;
    tracing::info!(did = %cookie_session.did, "signed in");
    Ok((jar.add(cookie), redirect("/")?))
}

/// POST /oauth/logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<CookieSession>,
    jar: SignedCookieJar,
) -> AppResult<(SignedCookieJar, Json<serde_json::Value>)> {
    if let Err(e) = state.sessions.sign_out(&session).await {
        tracing::warn!(did = %session.did, error = %e, "session delete failed on logout");
    }
    tracing::info!(did = %session.did, "signed out");
    Ok((
        jar.remove(clear_session_cookie(&state)),
        Json(json!({ "success": true })),
    ))
}

/// GET /api/session
pub async fn whoami(Extension(session): Extension<CookieSession>) -> Json<serde_json::Value> {
    Json(json!({
        "did": session.did,
        "handle": session.handle,
        "pdsUrl": session.pds_url,
    }))
}

/// GET /.well-known/oauth-client-metadata
pub async fn client_metadata(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "client_id": state.config.oauth.client_id,
        "client_name": "tangled",
        "client_uri": state.config.server.base_url,
        "redirect_uris": [state.config.oauth.redirect_uri],
        "scope": state.config.oauth.scopes.join(" "),
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "private_key_jwt",
        "token_endpoint_auth_signing_alg": "ES256",
        "jwks_uri": format!("{}/.well-known/jwks.json", state.config.server.base_url),
        "application_type": "web",
        "dpop_bound_access_tokens": true,
    }))
}

/// GET /.well-known/jwks.json
pub async fn jwks(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.keys.to_jwks())
}
