pub mod routes;
pub mod state;

pub use state::{ApiConfig, AppState};

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes::api_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the API server.
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let bind_addr = state.config.bind.clone();
    let dry_run = state.config.dry_run;
    let app = build_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(dry_run, "API server listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
