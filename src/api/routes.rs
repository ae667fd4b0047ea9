use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::{routing::{get, post}, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::api::extract::{USER_ID_HEADER, USER_ROLE_HEADER};
use crate::api::handlers;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(vec![
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static(USER_ID_HEADER),
            axum::http::HeaderName::from_static(USER_ROLE_HEADER),
        ]);
    let body_limit = DefaultBodyLimit::max(state.cfg.max_request_bytes);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/events", post(handlers::create_event).get(handlers::list_events))
        .route("/events/:event_id/batches", post(handlers::submit_batch))
        .route("/events/:event_id/query", post(handlers::query_index))
        .route("/events/:event_id/search", post(handlers::search_selfie))
        .route("/batches/:id", get(handlers::batch_status))
        .route("/batches/:id/stream", get(handlers::batch_stream))
        .route("/batches/:id/cancel", post(handlers::cancel_batch))
        .route("/photos/:id", get(handlers::photo))
        .layer(body_limit)
        .layer(cors)
        .with_state(state)
}
