use stock_chat_agent::{
    api::{build_state, start_server, ToolSet},
    config::AppConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables before the filter reads RUST_LOG
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    info!("🚀 Stock Chat Agent - API Server");
    info!("📍 Address: {}", config.bind_address());
    info!("🤖 Model: {} via {}", config.model, config.llm_base_url);

    let state = build_state(&config, ToolSet::MarketData)?;

    info!("✅ Agent initialized with market data tools");
    info!("📡 Starting API server...");

    start_server(state, &config.bind_address()).await?;

    Ok(())
}
