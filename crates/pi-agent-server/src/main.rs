use anyhow::Result;
use tracing::info;

use pi_agent_server::config::Settings;
use pi_agent_server::utils::logger::init_logger;
use pi_agent_server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (.env first so RUST_LOG/LOG_FORMAT from it apply)
    let settings = Settings::load()?;

    // Initialize logging
    init_logger()?;

    info!("🚀 Starting Pi Agent Server...");
    info!(
        "✅ Configuration loaded: provider={}, model={}, memory_enabled={}",
        settings.llm.provider, settings.llm.model, settings.memory.enabled
    );

    let addr = settings.socket_addr()?;

    // Initialize services
    let state = AppState::from_settings(&settings)?;
    info!("✅ Chat service ready");

    let chat_service = state.chat_service.clone();
    let app = build_router(state);

    info!("🎯 Server listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Stop live streams
            chat_service.shutdown();
        })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
