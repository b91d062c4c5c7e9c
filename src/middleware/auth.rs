//! Authentication middleware
//!
//! Resolves the signed session cookie and injects the `CookieSession` into
//! request extensions. The cookie carries identity only; tokens stay in the
//! session store.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};

use crate::config::AppState;
use crate::error::AppError;
use crate::models::CookieSession;

/// Read the session out of the signed jar, if any.
pub fn session_from_jar(jar: &SignedCookieJar, cookie_name: &str) -> Option<CookieSession> {
    let cookie = jar.get(cookie_name)?;
    serde_json::from_str(cookie.value()).ok()
}

/// Build the session cookie set at OAuth callback.
pub fn build_session_cookie(
    state: &AppState,
    session: &CookieSession,
) -> Result<Cookie<'static>, AppError> {
    let value = serde_json::to_string(session)?;
    Ok(Cookie::build((state.config.cookie.name.clone(), value))
        .path("/")
        .http_only(true)
        .secure(state.config.cookie.secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(60))
        .build())
}

pub fn clear_session_cookie(state: &AppState) -> Cookie<'static> {
    Cookie::build((state.config.cookie.name.clone(), ""))
        .path("/")
        .http_only(true)
        .max_age(time::Duration::ZERO)
        .build()
}

/// Require an authenticated session; handlers read it from extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let session = session_from_jar(&jar, &state.config.cookie.name)
        .filter(|session| session.authenticated)
        .ok_or(AppError::NotAuthenticated)?;
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}
