use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ThrottlingConfig;
use crate::error::ThrottlerError;
use crate::filter::{throttling_middleware, ThrottlingFilter};

/// Wraps the protected service routes in the throttling filter and mounts
/// the management endpoints next to them. Management routes sit outside the
/// filter: an operator checking `/metrics` must not be throttled by the very
/// thing they are inspecting.
pub fn build_router(filter: Arc<ThrottlingFilter>, service: Router) -> Router {
    let management = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .with_state(filter.clone());

    service
        .layer(middleware::from_fn_with_state(filter, throttling_middleware))
        .merge(management)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn metrics(State(filter): State<Arc<ThrottlingFilter>>) -> impl IntoResponse {
    Json(filter.metrics_snapshot())
}

/// Runs the server until shutdown. The listener serves with connect info so
/// the filter sees source addresses.
pub async fn run(config: ThrottlingConfig, service: Router) -> Result<(), ThrottlerError> {
    let filter = Arc::new(ThrottlingFilter::new(&config));
    let app = build_router(filter, service).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
