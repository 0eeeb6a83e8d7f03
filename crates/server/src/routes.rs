//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and the text fields around a chunk.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let chunk_body_limit = usize::try_from(
        state
            .config
            .upload
            .max_chunk_size
            .saturating_add(MULTIPART_OVERHEAD),
    )
    .unwrap_or(usize::MAX);

    let upload_routes = Router::new()
        .route("/upload/init", post(handlers::init_upload))
        .route(
            "/upload/chunk",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(chunk_body_limit)),
        )
        .route("/upload/status/{upload_id}", get(handlers::get_upload_status))
        .route("/upload/artifact/{upload_id}", get(handlers::download_artifact))
        .route("/upload/{upload_id}", delete(handlers::cancel_upload));

    let mut router = Router::new()
        .merge(upload_routes)
        // Health check (unauthenticated for load balancers/k8s probes)
        .route("/health", get(handlers::health_check));

    // SECURITY: When enabled, this endpoint should be network-restricted to
    // the Prometheus scraper.
    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
