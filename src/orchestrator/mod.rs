//! Join orchestration
//!
//! Drives a node from nothing to a converged gossip member:
//!
//! ```text
//! Init ─▶ WaitIdentity ─▶ WaitAddress ─▶ StartGossip ─▶ Discover ─▶ Converged
//!   (start VPN)  (authorize, join network)  (gossip agent)  (find_any)
//! ```
//!
//! Any phase can end in cancellation or a fatal error. Whatever was started
//! is stopped in reverse order before [`JoinOrchestrator::run`] returns.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DiscoveryConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryError, DiscoveryGroup, TransportBinder};
use crate::membership::{GossipAgent, Membership};
use crate::readiness::{NetworkAddress, NodeIdentity, ReadinessError, ReadinessWaiter};
use crate::vpn::{Authorizer, VpnService};

/// Where the join currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Init,
    WaitIdentity,
    WaitAddress,
    StartGossip,
    Discover,
    Converged,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinPhase::Init => "init",
            JoinPhase::WaitIdentity => "wait-identity",
            JoinPhase::WaitAddress => "wait-address",
            JoinPhase::StartGossip => "start-gossip",
            JoinPhase::Discover => "discover",
            JoinPhase::Converged => "converged",
        };
        f.write_str(name)
    }
}

/// How a join run ended, short of a fatal error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Found other members, then shut down on request
    Converged {
        member: NodeIdentity,
        address: NetworkAddress,
    },
    /// Shut down on request before converging
    Cancelled { phase: JoinPhase },
}

/// Join errors
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("Join failed during {phase}: {reason}")]
    Fatal { phase: JoinPhase, reason: String },
}

/// What to join
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// VPN network id
    pub network: String,
    /// Interface the network shows up on
    pub interface: String,
    pub group: DiscoveryGroup,
}

/// External services the orchestrator drives
pub struct Collaborators {
    pub vpn: Arc<dyn VpnService>,
    /// Present only when self-authorization is configured
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub readiness: ReadinessWaiter,
    pub gossip: Arc<dyn GossipAgent>,
    pub membership: Arc<dyn Membership>,
    pub binder: Arc<dyn TransportBinder>,
}

/// Startup stopped early
enum Halt {
    Cancelled(JoinPhase),
    Fatal(JoinError),
}

impl Halt {
    fn fatal(phase: JoinPhase, reason: impl fmt::Display) -> Self {
        Halt::Fatal(JoinError::Fatal {
            phase,
            reason: reason.to_string(),
        })
    }
}

/// Services started so far, torn down in reverse
#[derive(Default)]
struct Running {
    vpn: bool,
    gossip: bool,
    discovery: Option<DiscoveryEngine>,
}

pub struct JoinOrchestrator {
    collaborators: Collaborators,
    request: JoinRequest,
    discovery: DiscoveryConfig,
    phase: watch::Sender<JoinPhase>,
}

impl JoinOrchestrator {
    pub fn new(collaborators: Collaborators, request: JoinRequest, discovery: DiscoveryConfig) -> Self {
        let (phase, _) = watch::channel(JoinPhase::Init);
        Self {
            collaborators,
            request,
            discovery,
            phase,
        }
    }

    pub fn phase(&self) -> JoinPhase {
        *self.phase.borrow()
    }

    /// Follow phase transitions
    pub fn subscribe(&self) -> watch::Receiver<JoinPhase> {
        self.phase.subscribe()
    }

    /// Join and stay joined until `cancel` fires.
    ///
    /// Returns once every started service has been stopped.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<JoinOutcome, JoinError> {
        let mut running = Running::default();

        let result = match self.start_up(cancel, &mut running).await {
            Ok((member, address)) => {
                self.enter(JoinPhase::Converged);
                info!(%member, ip = %address.ip(), "Gossip is up and running");

                match self.hold(cancel, running.discovery.as_ref()).await {
                    Ok(()) => Ok(JoinOutcome::Converged { member, address }),
                    Err(Halt::Cancelled(_)) => Ok(JoinOutcome::Converged { member, address }),
                    Err(Halt::Fatal(e)) => Err(e),
                }
            }
            Err(Halt::Cancelled(phase)) => {
                info!(%phase, "Join cancelled");
                Ok(JoinOutcome::Cancelled { phase })
            }
            Err(Halt::Fatal(e)) => Err(e),
        };

        if let Err(e) = &result {
            error!(error = %e, "Join failed, shutting down");
        }
        self.teardown(running).await;
        result
    }

    fn enter(&self, phase: JoinPhase) {
        self.phase.send_replace(phase);
    }

    async fn start_up(
        &self,
        cancel: &CancellationToken,
        running: &mut Running,
    ) -> Result<(NodeIdentity, NetworkAddress), Halt> {
        let c = &self.collaborators;
        let request = &self.request;

        self.enter(JoinPhase::Init);
        info!("Starting VPN daemon");
        c.vpn
            .start()
            .await
            .map_err(|e| Halt::fatal(JoinPhase::Init, e))?;
        running.vpn = true;

        self.enter(JoinPhase::WaitIdentity);
        info!("Waiting for VPN identity");
        let member = c
            .readiness
            .await_identity(cancel)
            .await
            .map_err(|e| readiness_halt(JoinPhase::WaitIdentity, e))?;
        info!(%member, "VPN identity assigned");

        if let Some(authorizer) = &c.authorizer {
            info!(%member, network = %request.network, "Authorizing this member");
            if let Err(e) = authorizer.authorize(&request.network, &member).await {
                warn!(
                    %member,
                    error = %e,
                    "Failed to authorize this member, it may need to be authorized manually"
                );
            }
        }

        self.enter(JoinPhase::WaitAddress);
        info!(network = %request.network, interface = %request.interface, "Joining network");
        c.vpn
            .join(&request.network)
            .await
            .map_err(|e| Halt::fatal(JoinPhase::WaitAddress, e))?;
        let address = c
            .readiness
            .await_address(cancel, &request.interface)
            .await
            .map_err(|e| readiness_halt(JoinPhase::WaitAddress, e))?;

        self.enter(JoinPhase::StartGossip);
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled(JoinPhase::StartGossip));
        }
        info!(%member, ip = %address.ip(), "Joined network, starting gossip agent");
        c.gossip
            .start(address.ip())
            .await
            .map_err(|e| Halt::fatal(JoinPhase::StartGossip, e))?;
        running.gossip = true;

        self.enter(JoinPhase::Discover);
        if cancel.is_cancelled() {
            return Err(Halt::Cancelled(JoinPhase::Discover));
        }
        let mut engine = DiscoveryEngine::new(
            request.group,
            address.clone(),
            c.membership.clone(),
            &self.discovery,
        );
        engine
            .start(c.binder.as_ref())
            .map_err(|e| Halt::fatal(JoinPhase::Discover, e))?;
        let engine = running.discovery.insert(engine);

        info!(group = %request.group, "Searching for any gossip to join");
        engine
            .find_any(cancel)
            .await
            .map_err(|e| discovery_halt(JoinPhase::Discover, e))?;

        Ok((member, address))
    }

    /// Stay converged until cancelled
    async fn hold(
        &self,
        cancel: &CancellationToken,
        discovery: Option<&DiscoveryEngine>,
    ) -> Result<(), Halt> {
        match discovery {
            Some(engine) if self.discovery.rediscover => engine
                .rediscover(cancel)
                .await
                .map_err(|e| discovery_halt(JoinPhase::Converged, e)),
            _ => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }

    async fn teardown(&self, running: Running) {
        let c = &self.collaborators;

        if let Some(mut engine) = running.discovery {
            info!("Stopping discovery");
            if let Err(e) = engine.stop().await {
                error!(error = %e, "Failed to stop discovery");
            }
        }

        if running.gossip {
            info!("Stopping gossip agent");
            if let Err(e) = c.gossip.stop().await {
                error!(error = %e, "Failed to stop gossip agent");
            }
        }

        if running.vpn {
            info!("Stopping VPN daemon");
            if let Err(e) = c.vpn.stop().await {
                error!(error = %e, "Failed to stop VPN daemon");
            }
        }
    }
}

fn readiness_halt(phase: JoinPhase, e: ReadinessError) -> Halt {
    match e {
        ReadinessError::Cancelled => Halt::Cancelled(phase),
        other => Halt::fatal(phase, other),
    }
}

fn discovery_halt(phase: JoinPhase, e: DiscoveryError) -> Halt {
    match e {
        DiscoveryError::Cancelled => Halt::Cancelled(phase),
        other => Halt::fatal(phase, other),
    }
}
