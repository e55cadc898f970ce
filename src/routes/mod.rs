use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub mod admin;
pub mod health;
pub mod sdk;
pub mod sdk_auth;

pub use health::health;
pub use sdk_auth::{ApiKeyMetadata, SdkKey};

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    // SDK routes answer CORS preflight uniformly; browsers call these.
    let sdk_router = Router::new()
        .route("/init", post(sdk::init))
        .route("/snapshot", get(sdk::snapshot))
        .route("/evaluations", post(sdk::evaluations))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let admin_router = Router::new()
        .route("/snapshot", get(admin::get_snapshot))
        .route("/queue-snapshot", post(admin::queue_snapshot))
        .route("/publish-snapshot", post(admin::publish_snapshot))
        .route("/build-snapshot-sync", post(admin::build_snapshot_sync))
        .route("/submit-api-key", post(admin::submit_api_key))
        .route("/verify", post(admin::verify_api_key))
        .route("/revoke-api-key", post(admin::revoke_api_key));

    Router::new()
        .route("/health", get(health))
        .nest("/sdk", sdk_router)
        .nest("/admin", admin_router)
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
}

async fn not_found() -> ApiError {
    ApiError::not_found("no such route")
}

async fn method_not_allowed() -> ApiError {
    ApiError {
        status: axum::http::StatusCode::METHOD_NOT_ALLOWED,
        message: "method not allowed".to_string(),
    }
}
