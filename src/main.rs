//! cell: join a ZeroTier network and find the cluster's gossip ring
//!
//! - `cell join <NETWORK>` runs until interrupted
//! - `cell pull` is the gossip agent's handler for torrent announcements

use std::io::Read;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cell::config::{Config, Overrides};
use cell::discovery::{DiscoveryGroup, MulticastBinder, ProbeOptions};
use cell::exchange::Deluge;
use cell::membership::SerfAgent;
use cell::orchestrator::{Collaborators, JoinOrchestrator, JoinOutcome, JoinRequest};
use cell::readiness::{IdentityFile, InterfaceAddresses, ReadinessWaiter};
use cell::vpn::{Authorizer, CentralClient, ZeroTier};

#[derive(Parser)]
#[command(name = "cell")]
#[command(about = "Join a private network and bootstrap gossip membership over multicast")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "cell.toml")]
    config: PathBuf,

    /// ZeroTier Central API token, enables self-authorization
    #[arg(short, long, global = true, env = "ZEROTIER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a network and stay in the cluster until interrupted
    Join {
        /// ZeroTier network id
        network: String,

        /// Interface the network shows up on
        #[arg(short, long)]
        interface: Option<String>,

        /// Multicast group used for discovery
        #[arg(short, long)]
        group: Option<Ipv4Addr>,
    },

    /// Add the torrent whose URL is read from stdin
    Pull,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cell=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Command::Join {
            network,
            interface,
            group,
        } => {
            config.apply_overrides(Overrides {
                interface,
                group,
                token: cli.token,
            });
            config.validate()?;
            join(config, network).await
        }
        Command::Pull => pull(config).await,
    }
}

async fn join(config: Config, network: String) -> anyhow::Result<()> {
    cell::vpn::validate_network_id(&network)?;
    let group = DiscoveryGroup::new(config.discovery.group, config.discovery.port)?;

    let authorizer = CentralClient::from_config(&config.authorization)?
        .map(|client| Arc::new(client) as Arc<dyn Authorizer>);
    if authorizer.is_none() {
        info!("No API token, this member must be authorized on the network manually");
    }

    let serf = Arc::new(SerfAgent::new(config.gossip.clone()));
    let collaborators = Collaborators {
        vpn: Arc::new(ZeroTier::new(&config.vpn)),
        authorizer,
        readiness: ReadinessWaiter::new(
            Arc::new(IdentityFile::new(config.vpn.identity_path())),
            Arc::new(InterfaceAddresses::new()),
            config.vpn.poll_interval(),
        ),
        gossip: serf.clone(),
        membership: serf,
        binder: Arc::new(MulticastBinder::new(ProbeOptions::from(&config.discovery))),
    };

    let request = JoinRequest {
        network,
        interface: config.vpn.interface.clone(),
        group,
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let orchestrator = JoinOrchestrator::new(collaborators, request, config.discovery.clone());
    match orchestrator.run(&cancel).await {
        Ok(JoinOutcome::Converged { member, address }) => {
            info!(%member, ip = %address.ip(), "Left the cluster");
            Ok(())
        }
        Ok(JoinOutcome::Cancelled { phase }) => {
            info!(%phase, "Exited before joining the cluster");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Join failed");
            std::process::exit(1);
        }
    }
}

async fn pull(config: Config) -> anyhow::Result<()> {
    let url = tokio::task::spawn_blocking(|| {
        let mut url = String::new();
        std::io::stdin().read_to_string(&mut url).map(|_| url)
    })
    .await??;

    let dir = Deluge::new(&config.exchange).pull(&url).await?;
    info!(dir = %dir.display(), "Torrent added");
    Ok(())
}

/// Cancel `token` on the first SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for interrupt");
                }
                token.cancel();
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for interrupt");
                }
            }
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt");
        }
    }

    info!("Shutdown requested");
    token.cancel();
}
