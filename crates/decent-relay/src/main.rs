#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use decent_relay::config::{RelayConfig, DEFAULT_OUTBOX_CAPACITY, DEFAULT_PORT};
use decent_relay::AppState;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "decent-relay")]
#[command(about = "Decent signaling relay - assigns session ids and forwards call handshakes")]
struct Args {
    /// TCP port to listen on
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interface to bind
    #[arg(long, env = "DECENT_RELAY_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Tell senders when their target id is not connected
    #[arg(long, env = "DECENT_NOTIFY_UNREACHABLE", default_value_t = false)]
    notify_unreachable: bool,

    /// Frames queued per client before forwards to it are dropped
    #[arg(long, env = "DECENT_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox_capacity: usize,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            notify_unreachable: self.notify_unreachable,
            outbox_capacity: self.outbox_capacity.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    decent_common::init_tracing_with_default("decent_relay=info,tower_http=info");

    let addr = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("signaling relay listening on {}", listener.local_addr()?);
    if args.notify_unreachable {
        info!("unreachable targets will be reported to senders");
    }

    decent_relay::serve(listener, AppState::new(args.relay_config())).await?;
    Ok(())
}
