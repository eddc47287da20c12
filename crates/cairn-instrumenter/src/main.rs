use anyhow::Result;
use cairn_instrumenter::{backends, InstrumenterConfig, InstrumenterService, Runtime};
use cairn_protocol::bus::{key_instrumenter, KEY_ALL};
use cairn_protocol::net::RemoteBus;
use cairn_protocol::Peer;
use cairn_engine::MetricRegistry;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cairn=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/instrumenter.toml".to_string());
    let config = InstrumenterConfig::load(&config_path)?;

    let identity =
        cairn_common::sysinfo::host_identity("instrumenter", config.hostname.as_deref());
    tracing::info!(hostname = %identity.hostname, "cairn-instrumenter starting");

    // A malformed backend declaration is fatal before the node ever
    // announces itself.
    let mut registry = MetricRegistry::new();
    backends::register_all(&mut registry, &identity.hostname)?;
    tracing::info!(nmetrics = registry.nmetrics(), "backends loaded");

    let own_key = key_instrumenter(&identity.hostname);
    let (bus, inbound) =
        RemoteBus::connect(&config.bus_addr, vec![own_key.clone(), KEY_ALL.to_string()]).await?;
    let peer = Peer::new(bus, own_key);

    let service = InstrumenterService::new(peer, Runtime::new(registry), identity, inbound);
    tokio::select! {
        result = service.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down gracefully");
            Ok(())
        }
    }
}
