use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use mvirt_tunnel::bridge::{BridgeOptions, Tunnel};
use mvirt_tunnel::config::{Config, Role};
use mvirt_tunnel::transport::AnyTransport;
use mvirt_tunnel::tun::TunDevice;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-tunnel")]
#[command(about = "Userspace IP tunnel over pluggable transports")]
struct Args {
    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Subcommand)]
enum RoleCommand {
    /// Dial a tunnel server and forward this host's traffic to it
    Client(RunArgs),
    /// Accept tunnel clients and forward between them and this host
    Server(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Start even if the transport endpoint is routed through the tunnel
    #[arg(long)]
    skip_routing_check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mvirt_tunnel=info".parse()?))
        .init();

    let args = Args::parse();
    let (role, run) = match args.role {
        RoleCommand::Client(run) => (Role::Client, run),
        RoleCommand::Server(run) => (Role::Server, run),
    };

    let mut config = Config::load(&run.config)?;
    config.skip_routing_check |= run.skip_routing_check;
    config.validate_for(role)?;

    let transport = AnyTransport::from_config(&config.transport, role)?;

    let device = TunDevice::create(&config.tun.prefix, config.tun.cidr)
        .await
        .context("Failed to create TUN device (root privileges required)")?;

    if let Some(mtu) = transport.as_transport().max_payload() {
        device.set_mtu(u32::try_from(mtu)?).await?;
    }
    if role == Role::Client && config.tun.default_route {
        device.set_default_route().await?;
    }

    let interface = device.name.clone();
    let tunnel = Tunnel::new(Arc::new(device), BridgeOptions::from(&config));
    let running = tunnel.start(role, &transport)?;
    info!(
        ?role,
        interface = %interface,
        kind = %transport.as_transport().kind(),
        "Tunnel running"
    );

    // The forwarding loops block; wait for them off the runtime.
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("tunnel-wait".to_string())
        .spawn(move || {
            let _ = done_tx.send(running.wait());
        })?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            Ok(())
        }
        done = done_rx => {
            let err = done.map_err(|_| anyhow!("tunnel waiter exited"))?;
            error!(error = %err, interface = %interface, "Tunnel terminated");
            Err(err.into())
        }
    }
}
