use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raccoon_gateway::config::GatewayConfig;
use raccoon_gateway::publisher::kafka::{KafkaProducer, KafkaTopicAdmin};
use raccoon_gateway::shutdown::ShutdownSignal;
use raccoon_gateway::Gateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Configuration
    dotenvy::dotenv().ok();
    let config = GatewayConfig::load()?;

    // 2. Logging: RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        port = config.server.port,
        brokers = %config.publisher.brokers,
        "Starting Raccoon gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    // 3. Broker clients
    let admin = Arc::new(KafkaTopicAdmin::new(&config.publisher)?);
    let producer = Arc::new(KafkaProducer::new(&config.publisher)?);

    // 4. Bind; failing here is the only fatal error
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;

    // 5. Serve until SIGINT/SIGTERM, then drain
    let shutdown = ShutdownSignal::new();
    let gateway = Gateway::new(config, admin, producer, shutdown.clone());

    tokio::spawn(async move { shutdown.listen().await });

    gateway.serve(listener).await?;
    Ok(())
}
