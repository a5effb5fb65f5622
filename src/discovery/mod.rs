//! Multicast discovery
//!
//! Bootstraps gossip membership with no prior knowledge of peers. Every node
//! is both a prober and a listener:
//! - the listener joins the sender of any datagram addressed to the group
//! - the prober multicasts an empty datagram to the group while the gossip
//!   agent knows no member besides this node
//!
//! Two fresh nodes therefore converge without a leader: whichever probes
//! first gets joined back by the other's listener. The probe payload carries
//! nothing; only its arrival and source address matter.
//!
//! ```text
//! Idle ──start──▶ Listening ⇄ Probing (find_any)
//!                     │
//!                   stop
//!                     ▼
//!                  Stopped
//! ```

mod listener;
pub mod socket;
pub mod transport;

pub use socket::{MulticastBinder, MulticastSocket, ProbeOptions};
pub use transport::{
    classify, DiscoveryTransport, InboundPacket, PacketDisposition, TransportBinder,
};

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::membership::Membership;
use crate::readiness::NetworkAddress;
use listener::{JoinThrottle, Listener};

/// Multicast group and port shared by all members of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryGroup {
    addr: Ipv4Addr,
    port: u16,
}

impl DiscoveryGroup {
    pub fn new(addr: Ipv4Addr, port: u16) -> Result<Self, DiscoveryError> {
        if !addr.is_multicast() {
            return Err(DiscoveryError::NotMulticast(addr));
        }
        Ok(Self { addr, port })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }
}

impl fmt::Display for DiscoveryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Lifecycle of the discovery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Listening,
    Probing,
    Stopped,
}

/// Discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{0} is not a multicast group")]
    NotMulticast(Ipv4Addr),

    #[error("Failed to bind discovery socket: {0}")]
    Bind(io::Error),

    #[error("Failed to send discovery probe: {0}")]
    Probe(io::Error),

    #[error("Discovery already started")]
    AlreadyStarted,

    #[error("Discovery is not listening")]
    NotStarted,

    #[error("Discovery already stopped")]
    AlreadyStopped,

    #[error("Cancelled while searching for peers")]
    Cancelled,
}

/// Owns the discovery socket, the listener task and the probe loop
pub struct DiscoveryEngine {
    group: DiscoveryGroup,
    local: NetworkAddress,
    membership: Arc<dyn Membership>,
    probe_interval: Duration,
    retry_interval: Duration,
    join_cooldown: Duration,
    join_timeout: Duration,
    state: watch::Sender<DiscoveryState>,
    transport: Option<Arc<dyn DiscoveryTransport>>,
    stop_tx: Option<oneshot::Sender<()>>,
    listener: Option<JoinHandle<()>>,
}

impl DiscoveryEngine {
    pub fn new(
        group: DiscoveryGroup,
        local: NetworkAddress,
        membership: Arc<dyn Membership>,
        config: &DiscoveryConfig,
    ) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Idle);
        Self {
            group,
            local,
            membership,
            probe_interval: config.probe_interval(),
            retry_interval: config.retry_interval(),
            join_cooldown: config.join_cooldown(),
            join_timeout: config.join_timeout(),
            state,
            transport: None,
            stop_tx: None,
            listener: None,
        }
    }

    pub fn group(&self) -> DiscoveryGroup {
        self.group
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    /// Bind the discovery socket through `binder` and start listening
    pub fn start(&mut self, binder: &dyn TransportBinder) -> Result<(), DiscoveryError> {
        if self.state() != DiscoveryState::Idle {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let transport = binder
            .bind(&self.group, &self.local)
            .map_err(DiscoveryError::Bind)?;
        self.start_with(transport)
    }

    /// Start listening on an already bound transport
    pub fn start_with(&mut self, transport: Arc<dyn DiscoveryTransport>) -> Result<(), DiscoveryError> {
        if self.state() != DiscoveryState::Idle {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let listener = Listener {
            transport: transport.clone(),
            membership: self.membership.clone(),
            group: self.group.addr(),
            local: self.local.ip(),
            throttle: JoinThrottle::new(self.join_cooldown),
            join_timeout: self.join_timeout,
        };

        self.listener = Some(tokio::spawn(listener.run(stop_rx)));
        self.stop_tx = Some(stop_tx);
        self.transport = Some(transport);
        self.state.send_replace(DiscoveryState::Listening);

        info!(
            group = %self.group,
            interface = %self.local.interface().name,
            "Listening for discovery probes"
        );
        Ok(())
    }

    /// Probe until the gossip agent reports at least one member besides us.
    ///
    /// Returns the alive count that ended the search. Convergence is decided
    /// by count only: it does not matter whether the other member answered
    /// our probe or found us on its own.
    pub async fn find_any(&self, cancel: &CancellationToken) -> Result<usize, DiscoveryError> {
        let transport = match (&self.transport, self.state()) {
            (Some(transport), DiscoveryState::Listening) => transport.clone(),
            _ => return Err(DiscoveryError::NotStarted),
        };

        self.state.send_replace(DiscoveryState::Probing);
        let result = self.probe_until_converged(transport.as_ref(), cancel).await;
        self.state.send_if_modified(|state| {
            if *state == DiscoveryState::Probing {
                *state = DiscoveryState::Listening;
                return true;
            }
            false
        });
        result
    }

    async fn probe_until_converged(
        &self,
        transport: &dyn DiscoveryTransport,
        cancel: &CancellationToken,
    ) -> Result<usize, DiscoveryError> {
        let mut probes: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }

            let alive = match self.membership.alive_count().await {
                Ok(alive) => alive,
                Err(e) => {
                    warn!(error = %e, "Failed to retrieve member list, retrying");
                    sleep_or_cancel(self.retry_interval, cancel).await?;
                    continue;
                }
            };

            if alive > 1 {
                info!(alive, probes, "Found other gossip members");
                return Ok(alive);
            }

            info!(
                alive,
                group = %self.group,
                "Only this node is alive, multicasting to find others"
            );
            transport
                .send(&[], self.group.socket_addr())
                .await
                .map_err(DiscoveryError::Probe)?;
            probes += 1;

            sleep_or_cancel(self.probe_interval, cancel).await?;
        }
    }

    /// After convergence, search again whenever this node is left alone.
    ///
    /// Runs until cancelled, then returns [`DiscoveryError::Cancelled`].
    pub async fn rediscover(&self, cancel: &CancellationToken) -> Result<(), DiscoveryError> {
        loop {
            sleep_or_cancel(self.probe_interval, cancel).await?;

            match self.membership.alive_count().await {
                Ok(alive) if alive <= 1 => {
                    info!(alive, "All other members are gone, searching again");
                    self.find_any(cancel).await?;
                }
                Ok(alive) => debug!(alive, "Membership healthy"),
                Err(e) => debug!(error = %e, "Membership check failed"),
            }
        }
    }

    /// Stop listening and release the socket.
    ///
    /// Waits for the listener task, so the socket is closed when this returns.
    pub async fn stop(&mut self) -> Result<(), DiscoveryError> {
        let Some(stop_tx) = self.stop_tx.take() else {
            return match self.state() {
                DiscoveryState::Stopped => Err(DiscoveryError::AlreadyStopped),
                _ => Err(DiscoveryError::NotStarted),
            };
        };

        // The listener may already have exited on a closed transport
        let _ = stop_tx.send(());
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                error!(error = %e, "Discovery listener task failed");
            }
        }

        self.transport = None;
        self.state.send_replace(DiscoveryState::Stopped);
        info!("Discovery stopped");
        Ok(())
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), DiscoveryError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DiscoveryError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
