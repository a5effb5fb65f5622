//! cell: join a private virtual network and bootstrap gossip membership
//!
//! A node running `cell join` starts the ZeroTier daemon, waits for its
//! identity and address, starts a Serf agent on that address and then finds
//! the rest of the cluster over local multicast, without any rendezvous
//! server.
//!
//! - [`readiness`]: polling for VPN identity and interface address
//! - [`membership`]: facade over the gossip agent
//! - [`discovery`]: multicast probe/listen bootstrap protocol
//! - [`orchestrator`]: the join sequence and its teardown
//! - [`vpn`], [`exchange`], [`process`]: external collaborators

pub mod config;
pub mod discovery;
pub mod exchange;
pub mod membership;
pub mod orchestrator;
pub mod process;
pub mod readiness;
pub mod vpn;
