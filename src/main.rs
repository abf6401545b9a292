//! # Messenger
//!
//! Entry point: tracing, configuration, then the server with its consumer
//! pipeline until a shutdown signal arrives.

use anyhow::Result;
use tracing::info;

use messenger::config::Settings;
use messenger::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    messenger::telemetry::init_tracing();

    info!("Starting Messenger...");

    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.environment,
        bus = ?settings.kafka.backend,
        topic = %settings.kafka.topic_messages,
        "Configuration loaded"
    );

    let application = Application::build(settings).await?;

    info!("Server ready to accept connections");
    application.run_until_stopped().await?;

    Ok(())
}
