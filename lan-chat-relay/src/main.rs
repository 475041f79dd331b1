use std::{io::IsTerminal, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

use lan_chat_relay::{
    cli::{Cli, Command, DiscoverArgs, ServeArgs},
    discovery::{self, DiscoveryResponder},
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Discover(args) => find_relay(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind chat listener on {}", args.listen))?;
    let relay = Relay::new(listener, args.relay_options());
    info!("relay listening on {}", relay.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let discovery_task = if args.no_discovery {
        None
    } else {
        let responder = DiscoveryResponder::bind(args.discovery)
            .await
            .with_context(|| format!("failed to bind discovery socket on {}", args.discovery))?;
        info!("discovery listening on {}", responder.local_addr()?);
        let mut shutdown_rx = shutdown_rx;
        Some(tokio::spawn(async move {
            responder
                .run_until(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        }))
    };

    let result = relay.run_until_ctrl_c().await;

    let _ = shutdown_tx.send(true);
    if let Some(task) = discovery_task {
        if let Err(err) = task.await {
            warn!(error = ?err, "discovery task ended abnormally");
        }
    }

    if let Err(err) = &result {
        warn!("relay exited with error: {err:?}");
    }
    result
}

async fn find_relay(args: DiscoverArgs) -> Result<()> {
    match discovery::discover(args.target, Duration::from_millis(args.timeout_ms)).await? {
        Some(addr) => {
            println!("chat relay found at {}", addr.ip());
            Ok(())
        }
        None => anyhow::bail!("no chat relay answered at {}", args.target),
    }
}
