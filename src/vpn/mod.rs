//! Virtual network collaborators
//!
//! - [`ZeroTier`]: the ZeroTier daemon and its control CLI
//! - [`central`]: self-authorization against the ZeroTier Central API
//!
//! Identity and address readiness are polled separately (see
//! [`crate::readiness`]); starting the daemon and joining a network return as
//! soon as the command has been issued.

pub mod central;

pub use central::{AuthorizationError, Authorizer, CentralClient};

use std::path::PathBuf;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::VpnConfig;
use crate::process::{self, ProcessError};

/// Length of a ZeroTier network id in hex digits
const NETWORK_ID_LEN: usize = 16;

/// VPN errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("Invalid network id {0:?}: expected {NETWORK_ID_LEN} hex digits")]
    InvalidNetwork(String),

    #[error("VPN daemon already started")]
    AlreadyStarted,

    #[error("VPN process error: {0}")]
    Process(#[from] ProcessError),
}

/// Lifecycle of the VPN layer
#[async_trait::async_trait]
pub trait VpnService: Send + Sync {
    /// Start the daemon
    async fn start(&self) -> Result<(), VpnError>;

    /// Ask the daemon to join `network`
    async fn join(&self, network: &str) -> Result<(), VpnError>;

    /// Stop the daemon; a no-op when it was never started
    async fn stop(&self) -> Result<(), VpnError>;
}

/// Check that `network` looks like a ZeroTier network id
pub fn validate_network_id(network: &str) -> Result<(), VpnError> {
    if network.len() != NETWORK_ID_LEN || !network.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VpnError::InvalidNetwork(network.to_string()));
    }
    Ok(())
}

/// ZeroTier daemon running as a child process
pub struct ZeroTier {
    daemon: PathBuf,
    cli: String,
    process: Mutex<Option<Child>>,
}

impl ZeroTier {
    pub fn new(config: &VpnConfig) -> Self {
        Self {
            daemon: config.daemon_path(),
            cli: config.cli.clone(),
            process: Mutex::new(None),
        }
    }

    fn daemon_name(&self) -> String {
        self.daemon.display().to_string()
    }
}

#[async_trait::async_trait]
impl VpnService for ZeroTier {
    async fn start(&self) -> Result<(), VpnError> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Err(VpnError::AlreadyStarted);
        }

        let no_args: [&str; 0] = [];
        let child = process::spawn_daemon(&self.daemon_name(), &no_args)?;
        info!(daemon = %self.daemon.display(), pid = ?child.id(), "ZeroTier daemon started");
        *process = Some(child);
        Ok(())
    }

    async fn join(&self, network: &str) -> Result<(), VpnError> {
        validate_network_id(network)?;
        process::run(&self.cli, &["join", network]).await?;
        info!(network, "Requested network join");
        Ok(())
    }

    async fn stop(&self) -> Result<(), VpnError> {
        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        let status = process::interrupt_and_wait(&mut child, &self.daemon_name()).await?;
        if status.success() {
            info!("ZeroTier daemon stopped");
        } else {
            warn!(%status, "ZeroTier daemon exited uncleanly");
        }
        Ok(())
    }
}
