use clap::Parser;
use log::{error, info};
use nano_chat::{
    chat::ChatPlugin,
    config::{public_key_hex, Args, Config},
    ledger::Ledger,
    network::{
        discovery::{DiscoveryMessage, DiscoveryPlugin},
        message::{ChatMessage, MessageRegistry},
        NetworkBuilder,
    },
    session::{NetworkTransport, Session},
};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::from_args(args)?;

    let keys = config.keypair()?;
    info!("Peer ID: {}", keys.public().to_peer_id());
    info!("Public Key: {}", public_key_hex(&keys));

    let mut registry = MessageRegistry::new();
    registry.register::<DiscoveryMessage>()?;
    registry.register::<ChatMessage>()?;

    let ledger = Ledger::new();
    let network = NetworkBuilder::new()
        .keys(keys)
        .address(config.bind_address.clone())
        .registry(registry)
        // peer discovery first, then chat
        .add_plugin(DiscoveryPlugin)
        .add_plugin(ChatPlugin::new(ledger.clone(), config.snapshot_format))
        .build()?;
    let handle = network.handle();

    tokio::spawn(network.listen());

    if !config.peers.is_empty() {
        let dialed = handle.bootstrap(&config.peers).await;
        info!("Bootstrapping with {} of {} peers", dialed, config.peers.len());
    }

    let session = Session::new(
        ledger,
        NetworkTransport::new(handle, config.recipient_host.clone()),
        config.snapshot_format,
    );
    session.run(BufReader::new(tokio::io::stdin())).await?;

    // stdin is closed but peers may still be sending to us
    info!("Input closed, still serving until interrupted");
    tokio::signal::ctrl_c().await?;
    Ok(())
}
