//! Network readiness
//!
//! Before a node can take part in discovery it needs two things the VPN layer
//! hands out asynchronously:
//! - its member identity (written by the daemon on first start)
//! - an IPv4 address on the virtual network interface (after authorization)
//!
//! Both are polled on a fixed interval until they show up. Only cancellation
//! bounds the wait.

pub mod identity;
pub mod interface;

pub use identity::IdentityFile;
pub use interface::InterfaceAddresses;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a single readiness poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<T> {
    Ready(T),
    /// Not there yet, poll again later
    NotReady,
}

/// Member identifier assigned by the VPN layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Extract the member id from identity material (`<member>:<keys...>`)
    pub fn parse(material: &str) -> Result<Self, ReadinessError> {
        match material.trim().split_once(':') {
            Some((member, _)) if !member.is_empty() => Ok(Self(member.to_string())),
            _ => Err(ReadinessError::Malformed(format!(
                "unexpected identity content: {}",
                material.trim()
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network interface the virtual network is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    pub name: String,
    pub index: u32,
}

/// Unicast IPv4 address bound to the virtual network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    ip: Ipv4Addr,
    interface: InterfaceHandle,
}

impl NetworkAddress {
    pub fn new(ip: Ipv4Addr, interface: InterfaceHandle) -> Result<Self, ReadinessError> {
        if !is_unicast(ip) {
            return Err(ReadinessError::Malformed(format!(
                "{} on {} is not a unicast address",
                ip, interface.name
            )));
        }
        Ok(Self { ip, interface })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn interface(&self) -> &InterfaceHandle {
        &self.interface
    }
}

pub(crate) fn is_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() || ip.is_loopback())
}

/// Readiness errors
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("Cancelled while waiting for readiness")]
    Cancelled,

    #[error("Malformed readiness indicator: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of the node identity
#[async_trait::async_trait]
pub trait IdentitySource: Send + Sync {
    async fn read_identity(&self) -> Result<Readiness<NodeIdentity>, ReadinessError>;
}

/// Source of interface addresses
#[async_trait::async_trait]
pub trait AddressSource: Send + Sync {
    async fn lookup(&self, interface: &str) -> Result<Readiness<NetworkAddress>, ReadinessError>;
}

/// Polls identity and address sources until they are ready
pub struct ReadinessWaiter {
    identity: Arc<dyn IdentitySource>,
    addresses: Arc<dyn AddressSource>,
    poll_interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(
        identity: Arc<dyn IdentitySource>,
        addresses: Arc<dyn AddressSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            identity,
            addresses,
            poll_interval,
        }
    }

    /// Wait until the VPN layer has assigned this node an identity
    pub async fn await_identity(
        &self,
        cancel: &CancellationToken,
    ) -> Result<NodeIdentity, ReadinessError> {
        self.poll_until_ready(cancel, "identity", || self.identity.read_identity())
            .await
    }

    /// Wait until `interface` carries a unicast IPv4 address
    pub async fn await_address(
        &self,
        cancel: &CancellationToken,
        interface: &str,
    ) -> Result<NetworkAddress, ReadinessError> {
        self.poll_until_ready(cancel, "address", || self.addresses.lookup(interface))
            .await
    }

    async fn poll_until_ready<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        what: &'static str,
        mut check: F,
    ) -> Result<T, ReadinessError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Readiness<T>, ReadinessError>>,
    {
        let mut attempts: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ReadinessError::Cancelled);
            }

            attempts += 1;
            if let Readiness::Ready(value) = check().await? {
                debug!(what, attempts, "Readiness condition met");
                return Ok(value);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
