use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::info;

use slatemq::log::MemoryLogManager;
use slatemq::metastore::MemoryMetaStore;
use slatemq::request::LocalTransport;
use slatemq::service::{setup_tracing, Broker, BrokerConfig, GLOBAL_CONFIG};

#[derive(Parser, Debug)]
#[command(name = "slatemq", about = "replicated commit-log broker")]
struct CommandLine {
    /// Path to the broker config file (TOML)
    #[arg(short, long, default_value = "conf.toml")]
    conf: PathBuf,
}

/// Single-node launcher: in-memory metadata store and log manager, local
/// loopback transport. A clustered deployment swaps these seams for real
/// implementations.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let command_line = CommandLine::parse();
    let config = BrokerConfig::set_up_config(&command_line.conf)?;
    let _guard = setup_tracing("logs");
    GLOBAL_CONFIG
        .set(config.clone())
        .expect("config initialized twice");

    let metastore = Arc::new(MemoryMetaStore::new());
    let log_manager = Arc::new(MemoryLogManager::new(config.log.log_dirs.clone()));
    let transport = LocalTransport::new();

    let broker = Broker::startup(
        config,
        log_manager,
        metastore,
        transport.rpc(),
        transport.endpoint(),
    )
    .await?;
    transport.register(broker.broker_id(), broker.replica_manager().clone());

    info!("slatemq broker {} is running, ctrl-c to stop", broker.broker_id());
    tokio::signal::ctrl_c().await?;
    broker.shutdown().await;
    Ok(())
}
