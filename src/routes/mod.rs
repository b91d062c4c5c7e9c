//! Router assembly
//!
//! - `/oauth/*` - authentication endpoints
//! - `/.well-known/*` - OAuth client metadata
//! - `/api/*` - JSON surface for the write and read paths
//! - `/health`, `/metrics` - operational endpoints

pub mod health;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::config::AppState;
use crate::handlers::{labels, oauth, repos};
use crate::metrics;
use crate::middleware::auth_middleware;

pub fn create_router(state: AppState) -> Router<AppState> {
    let oauth_routes = Router::new()
        .route("/login", get(oauth::login).post(oauth::login))
        .route("/callback", get(oauth::callback))
        .route(
            "/logout",
            post(oauth::logout).layer(middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            )),
        );

    let wellknown_routes = Router::new()
        .route("/oauth-client-metadata", get(oauth::client_metadata))
        .route("/jwks.json", get(oauth::jwks));

    // Public reads.
    let read_routes = Router::new()
        .route("/repos/:owner/:name", get(repos::landing))
        .route("/repos/:owner/:name/diff", get(repos::diff))
        .route("/repos/:owner/:name/compare/:rev1/:rev2", get(repos::compare))
        .route("/repos/:owner/:name/archive", get(repos::archive))
        .route("/repos/:owner/:name/blob", get(repos::blob))
        .route(
            "/repos/:owner/:name/collaborators",
            get(repos::list_collaborators),
        )
        .route(
            "/repos/:owner/:name/artifacts/:tag",
            get(repos::list_artifacts),
        );

    // Authenticated writes.
    let write_routes = Router::new()
        .route("/session", get(oauth::whoami))
        .route("/repos", post(repos::create_repo))
        .route("/repos/fork", post(repos::fork_repo))
        .route(
            "/repo/:name",
            axum::routing::patch(repos::edit_repo).delete(repos::delete_repo),
        )
        .route("/repo/:name/default-branch", put(repos::set_default_branch))
        .route("/repo/:name/branch/:branch", delete(repos::delete_branch))
        .route("/repo/:name/sync", post(repos::fork_sync))
        .route("/repo/:name/collaborators", post(repos::add_collaborator))
        .route(
            "/repo/:name/collaborators/:subject",
            delete(repos::remove_collaborator),
        )
        .route(
            "/repo/:name/labels",
            post(labels::add_label_def).delete(labels::delete_label_def),
        )
        .route("/labels", put(labels::perform_label_op))
        .route(
            "/repo/:name/artifacts",
            post(repos::upload_artifact),
        )
        .route(
            "/repo/:name/artifacts/:rkey",
            delete(repos::delete_artifact),
        )
        .route(
            "/repo/:name/secrets",
            post(repos::add_secret).get(repos::list_secrets),
        )
        .route("/repo/:name/secrets/:key", delete(repos::remove_secret))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/oauth", oauth_routes)
        .nest("/.well-known", wellknown_routes)
        .nest("/api", read_routes.merge(write_routes))
}
