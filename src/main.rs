use anyhow::Result;
use axum::routing::get;
use axum::Router;
use query_throttler::config::ThrottlingConfig;
use query_throttler::server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = ThrottlingConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("query_throttler={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting query throttler");
    tracing::info!(
        "Configuration: bind_address={}, throttling_enabled={}",
        config.bind_address,
        config.enabled
    );

    // The protected endpoint. The real query engine mounts here; the stub
    // keeps the binary runnable on its own.
    let service = Router::new().route("/sparql", get(query_stub).post(query_stub));

    server::run(config, service)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

async fn query_stub() -> &'static str {
    "Query service is running.\n"
}
