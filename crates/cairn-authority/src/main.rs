use anyhow::Result;
use cairn_authority::{AuthorityConfig, AuthorityService};
use cairn_protocol::bus::{key_authority, LocalBus, KEY_ALL};
use cairn_protocol::net;
use cairn_protocol::Peer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cairn=info".parse()?))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AuthorityConfig::load(&path)?,
        None => AuthorityConfig::default(),
    };

    let identity = cairn_common::sysinfo::host_identity("authority", config.hostname.as_deref());
    tracing::info!(hostname = %identity.hostname, "cairn-authority starting");

    // The authority embeds the relay; agents connect to it.
    let bus = Arc::new(LocalBus::new());
    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "bus relay listening");
    tokio::spawn(net::serve_relay(listener, bus.clone()));

    let inbound = bus.attach(&[key_authority(), KEY_ALL.to_string()]);
    let peer = Peer::new(bus, key_authority());

    let (service, handle) = AuthorityService::new(peer, identity, &config, inbound);
    // The handle is what an HTTP surface would drive; hold it so the
    // service loop outlives startup even with no surface attached.
    let _handle = handle;

    tokio::select! {
        result = service.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down gracefully");
            Ok(())
        }
    }
}
