//! Middleware

mod auth;

pub use auth::{auth_middleware, build_session_cookie, clear_session_cookie, session_from_jar};
