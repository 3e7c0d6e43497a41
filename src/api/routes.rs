use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    let mut router = Router::new()
        // Attachments
        .route(
            "/attachments",
            post(handlers::create_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/attachments/url", post(handlers::create_attachment_from_url))
        .route("/attachments/download/:token", get(handlers::download_by_token))
        .route("/attachments/:id", get(handlers::get_attachment))
        .route("/attachments/:id", delete(handlers::delete_attachment))
        .route("/attachments/:id/url", get(handlers::obtain_attachment_url))
        .route("/attachments/:id/usages", post(handlers::add_usage))
        .route("/attachments/:id/usages", delete(handlers::remove_usage))
        // Public content and image derivatives
        .route("/storage/*path", get(handlers::serve_public))
        .route("/images/:preset/*path", get(handlers::serve_image))
        // Maintenance
        .route("/admin/cleanup", post(handlers::admin_cleanup))
        .route(
            "/admin/image-cache/:group",
            delete(handlers::admin_invalidate_image_cache),
        )
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled — purge route is available.");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
