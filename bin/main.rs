use fedblock::block::factoid::SimpleLedger;
use fedblock::config::Configuration;
use fedblock::engine::Engine;
use fedblock::logging::init_logging;
use fedblock::network::channel_pair;
use fedblock::storage::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "fedblock.toml".to_string());
    let config = Configuration::try_load(&config_path)?;
    init_logging(config.node.log_filter.as_deref());
    log::info!("loaded configuration from {config_path}");

    let (channels, mut network) = channel_pair(config.network.channel_capacity);
    let engine = Engine::init(
        config,
        Box::new(MemoryStore::new()),
        Box::new(SimpleLedger::default()),
        channels,
    )
    .await?;

    // The p2p transport is an external collaborator; until one is attached,
    // drain the outbound queue so the engine never blocks on it.
    tokio::spawn(async move {
        while let Some(outbound) = network.out_queue.recv().await {
            log::trace!(
                "outbound ({}) {}",
                if outbound.peer_to_peer { "p2p" } else { "bcast" },
                outbound.message
            );
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    engine.run(shutdown_rx).await;
    Ok(())
}
