//! REST surface for operators and the dashboard.
//!
//! Queries, reply actions, manual injection, statistics and CSV export.
//! Handlers are thin: all state transitions go through the store or
//! [`ReviewService`].

mod error;
mod export;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::review::ReviewService;
use crate::store::Database;

pub use error::ApiError;
pub use export::items_to_csv;
pub use handlers::{IngestRequest, ReplyRequest};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub review: Arc<ReviewService>,
}

/// Build the Axum router with all API routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/items", get(handlers::list_items))
        .route("/api/items/{id}", get(handlers::get_item))
        .route("/api/items/{id}/reply", post(handlers::submit_reply))
        .route("/api/ingest", post(handlers::ingest))
        .route("/api/ingest/bulk", post(handlers::ingest_bulk))
        .route("/api/stats", get(handlers::stats))
        .route("/api/export", get(export::export_csv))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600))
}
