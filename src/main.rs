//! tangled appview
//!
//! Binds the HTTP surface, connects the session store and index, and spawns
//! the event ingestor fleet.

use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tangled_appview::{config, metrics, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tangled_appview=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting tangled appview v{}", env!("CARGO_PKG_VERSION"));

    let app_config = config::AppConfig::load().map_err(|e| {
        tracing::error!("failed to load configuration: {}", e);
        anyhow::anyhow!("configuration error: {}", e)
    })?;

    let addr = SocketAddr::from((
        app_config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or([127, 0, 0, 1].into()),
        app_config.server.port,
    ));

    let state = config::AppState::new(app_config).await?;
    metrics::register_metrics();

    // One long-lived consumer per knot/spindle the index references.
    state.ingestor.run().await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: config::AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down, draining event consumers");
    state.ingestor.shutdown();
}
