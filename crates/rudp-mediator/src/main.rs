//! rudp-mediator
//!
//! The cookie-authenticated rendezvous point two peers behind NAT use
//! to discover each other's addresses before punching through
//! directly, per the NAT punch-through sub-protocol spoken over the
//! `PRX`-flagged control channel.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{debug, info, warn};

use rudp_config::Config;
use rudp_mediator::mediator::Mediator;

#[derive(Parser)]
#[command(name = "rudp-mediator")]
#[command(about = "NAT punch-through rendezvous mediator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mediator, listening for rendezvous traffic.
    Run {
        /// Configuration file path.
        #[arg(short, long, default_value = "/etc/rudp/mediator.toml")]
        config: PathBuf,
    },

    /// Validate a configuration file without starting the mediator.
    CheckConfig {
        /// Configuration file path.
        #[arg(short, long, default_value = "/etc/rudp/mediator.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = Config::load(&config)
                .with_context(|| format!("failed to load config from {:?}", config))?;
            setup_logging(&config);
            run_mediator(config).await?;
        }
        Commands::CheckConfig { config } => {
            let config = Config::load(&config)
                .with_context(|| format!("failed to load config from {:?}", config))?;
            config.validate().context("configuration is invalid")?;
            println!("configuration OK");
        }
    }

    Ok(())
}

fn setup_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }
}

/// Idle time after which a rendezvous pair or rate-limit window is
/// dropped if it has seen no traffic.
const PAIR_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

async fn run_mediator(config: Config) -> Result<()> {
    let bind_addr = config.mediator.bind_addr();
    let socket = UdpSocket::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind mediator socket on {bind_addr}"))?;
    info!(%bind_addr, rate_limit = config.mediator.rate_limit, "mediator listening");

    let mut mediator = Mediator::new(config.mediator.rate_limit, PAIR_IDLE_TIMEOUT);
    let mut cleanup = interval(CLEANUP_INTERVAL);
    let mut buf = [0u8; 65536];

    // Packets are handled inline on this task rather than spawned off:
    // `Mediator` is plain (non-`Send`-sensitive) state owned by this
    // loop, and per-packet work is cheap enough that a dedicated task
    // per datagram would only add overhead.
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, remote) = match result {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(%err, "mediator socket recv error");
                        continue;
                    }
                };

                let now = Instant::now();
                let outbound = mediator.on_packet(now, bind_addr, remote, &buf[..len]);
                for datagram in outbound {
                    if let Err(err) = socket.send_to(&datagram.data, datagram.to).await {
                        debug!(to = %datagram.to, %err, "failed to send mediator reply");
                    }
                }
            }
            _ = cleanup.tick() => {
                mediator.evict_stale(Instant::now());
            }
        }
    }
}
