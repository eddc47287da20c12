use anyhow::Result;
use cairn_aggregator::{AggregatorConfig, AggregatorService, SeriesStore};
use cairn_protocol::bus::{key_aggregator, KEY_ALL};
use cairn_protocol::net::RemoteBus;
use cairn_protocol::Peer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cairn=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/aggregator.toml".to_string());
    let config = AggregatorConfig::load(&config_path)?;

    let identity = cairn_common::sysinfo::host_identity("aggregator", config.hostname.as_deref());
    tracing::info!(hostname = %identity.hostname, "cairn-aggregator starting");

    let own_key = key_aggregator(&identity.hostname);
    let (bus, inbound) =
        RemoteBus::connect(&config.bus_addr, vec![own_key.clone(), KEY_ALL.to_string()]).await?;
    let peer = Peer::new(bus, own_key);

    let (service, handle) =
        AggregatorService::new(peer, SeriesStore::new(), identity, config.http_port, inbound);
    // The handle is what the HTTP value surface would read from; hold
    // it so the service loop outlives startup even without one.
    let _handle = handle;

    tokio::select! {
        result = service.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down gracefully");
            Ok(())
        }
    }
}
