//! Gossip membership
//!
//! The gossip ring itself is run by an external agent. This module only
//! exposes what bootstrap needs from it:
//! - how many members are alive (including this node)
//! - a way to ask the agent to join a peer
//! - starting and stopping the agent

pub mod serf;

pub use serf::SerfAgent;

use std::net::Ipv4Addr;

use crate::process::ProcessError;

/// Membership errors
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// The agent could not be reached; callers decide whether to retry
    #[error("Gossip agent unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to join {address}: {reason}")]
    JoinFailed { address: Ipv4Addr, reason: String },

    #[error("Gossip agent already started")]
    AlreadyStarted,

    #[error("Gossip agent process error: {0}")]
    Agent(#[from] ProcessError),
}

/// Read/join access to the member set kept by the gossip agent.
///
/// Implementations must tolerate concurrent calls; the discovery listener and
/// prober both use the same handle.
#[async_trait::async_trait]
pub trait Membership: Send + Sync {
    /// Number of alive members, including this node
    async fn alive_count(&self) -> Result<usize, MembershipError>;

    /// Ask the agent to join the member at `address`. Joining an existing
    /// member succeeds without effect.
    async fn join(&self, address: Ipv4Addr) -> Result<(), MembershipError>;
}

/// Lifecycle of the gossip agent
#[async_trait::async_trait]
pub trait GossipAgent: Send + Sync {
    /// Start the agent bound to `bind`
    async fn start(&self, bind: Ipv4Addr) -> Result<(), MembershipError>;

    /// Stop the agent; a no-op when it was never started
    async fn stop(&self) -> Result<(), MembershipError>;
}
