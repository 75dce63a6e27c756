//! Standalone relay process: runs the election and serves until
//! interrupted.

use std::time::Duration;

use clap::Parser;
use relay_hub::{bootstrap, ClientEvent, ClientIdentity, RelayConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-hub", about = "Embedded relay router/peer", version)]
struct Args {
    /// Relay bind/connect address.
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Well-known relay port; the control surface uses the next port up.
    #[arg(long, env = "RELAY_PORT", default_value_t = 9000)]
    port: u16,

    /// Declared client type.
    #[arg(long, env = "RELAY_CLIENT_TYPE", default_value = "server")]
    client_type: String,

    /// Declared display name.
    #[arg(long, env = "RELAY_NAME", default_value = "relay-hub")]
    name: String,

    /// Grace period in milliseconds between shutdown notice and close.
    #[arg(long, env = "RELAY_GRACE_MS", default_value_t = 3000)]
    grace_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        host: args.host,
        port: args.port,
        grace_period: Duration::from_millis(args.grace_ms),
        ..RelayConfig::default()
    };
    let identity = ClientIdentity::new(args.client_type, args.name);

    let (relay, mut events) = bootstrap(config, identity).await?;
    info!(is_router = relay.is_router(), "relay started");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "signal listener failed");
                }
                break;
            }
            event = events.recv() => match event {
                Some(ClientEvent::ShutdownNotice { reason, grace_period_ms }) => {
                    info!(reason = %reason, grace_period_ms, "router is shutting down");
                }
                Some(ClientEvent::Connected) => info!("connected to router"),
                Some(ClientEvent::Disconnected) => warn!("connection lost, reconnecting"),
                Some(_) => {}
                None => break,
            },
        }
    }

    info!("shutting down");
    relay.shutdown("interrupt").await;
    Ok(())
}
