//! Soulmesh node binary.

use soulmesh_node::{NodeConfig, SoulmeshNode, Storage};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("soulmesh-node {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "soulmesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::load()?;

    if args.iter().any(|a| a == "--rotate-identity") {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Storage::open(config.data_dir.join("db"))?;
        let identity = storage.rotate_identity()?;
        storage.flush()?;
        tracing::info!("New peer id: {}", identity.peer_id());
        return Ok(());
    }

    let node = SoulmeshNode::new(config)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                on_signal.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for interrupt: {}", e),
        }
    });

    node.run(shutdown).await?;
    Ok(())
}
