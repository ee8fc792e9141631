use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::SyncError;
pub use services::attempt_sync_service::AttemptSyncService;
pub use services::AppState;

/// Adds the Content-Security-Policy header to every response
async fn csp_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1/attempts", attempt_routes())
        .route("/api/v1/sync/stats", get(handlers::attempts::sync_stats))
        .with_state(app_state)
        .layer(cors)
        .layer(middleware::from_fn(csp_middleware))
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn attempt_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}/state", get(handlers::attempts::get_state))
        .route("/{id}/autosave", post(handlers::attempts::auto_save))
        .route("/{id}/sync", post(handlers::attempts::synchronize))
        .route("/{id}/force-sync", post(handlers::attempts::force_sync))
        .route("/{id}/submit", post(handlers::attempts::submit))
        .route("/{id}/stats", get(handlers::attempts::attempt_stats))
        .route("/{id}/stream", get(handlers::sse::attempt_stream))
        .route(
            "/{id}/connections",
            post(handlers::connections::open_connection),
        )
        .route(
            "/{id}/connections/{connection_id}",
            delete(handlers::connections::close_connection),
        )
}
