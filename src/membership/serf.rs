//! Serf agent driven through the `serf` CLI

use std::net::Ipv4Addr;

use serde::de::IgnoredAny;
use serde::Deserialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{GossipAgent, Membership, MembershipError};
use crate::config::GossipConfig;
use crate::process;

/// `serf members -format=json` output, only the member count matters
#[derive(Debug, Deserialize)]
struct MembersDocument {
    members: Vec<IgnoredAny>,
}

/// Serf agent running as a child process
pub struct SerfAgent {
    config: GossipConfig,
    process: Mutex<Option<Child>>,
}

impl SerfAgent {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
        }
    }

    fn agent_args(&self, bind: Ipv4Addr) -> Vec<String> {
        let mut args = vec!["agent".to_string(), format!("-bind={}", bind)];
        for handler in &self.config.event_handlers {
            args.push(format!("-event-handler={}", handler));
        }
        args.extend(self.rpc_args());
        args
    }

    fn rpc_args(&self) -> Option<String> {
        self.config
            .rpc_addr
            .as_ref()
            .map(|addr| format!("-rpc-addr={}", addr))
    }
}

/// Count members in a `serf members -format=json` document
fn count_members(document: &[u8]) -> Result<usize, MembershipError> {
    let parsed: MembersDocument = serde_json::from_slice(document)
        .map_err(|e| MembershipError::Unavailable(format!("unreadable member list: {}", e)))?;
    Ok(parsed.members.len())
}

#[async_trait::async_trait]
impl Membership for SerfAgent {
    async fn alive_count(&self) -> Result<usize, MembershipError> {
        let mut args = vec![
            "members".to_string(),
            "-status=alive".to_string(),
            "-format=json".to_string(),
        ];
        args.extend(self.rpc_args());

        let output = process::capture(&self.config.binary, &args)
            .await
            .map_err(|e| MembershipError::Unavailable(e.to_string()))?;
        count_members(&output)
    }

    async fn join(&self, address: Ipv4Addr) -> Result<(), MembershipError> {
        let mut args = vec!["join".to_string(), address.to_string()];
        args.extend(self.rpc_args());

        debug!(%address, "Joining gossip peer");
        process::run(&self.config.binary, &args)
            .await
            .map_err(|e| MembershipError::JoinFailed {
                address,
                reason: e.to_string(),
            })
    }
}

#[async_trait::async_trait]
impl GossipAgent for SerfAgent {
    async fn start(&self, bind: Ipv4Addr) -> Result<(), MembershipError> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Err(MembershipError::AlreadyStarted);
        }

        let child = process::spawn_daemon(&self.config.binary, &self.agent_args(bind))?;
        info!(%bind, pid = ?child.id(), "Serf agent started");
        *process = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<(), MembershipError> {
        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        let status = process::interrupt_and_wait(&mut child, &self.config.binary).await?;
        if status.success() {
            info!("Serf agent stopped");
        } else {
            warn!(%status, "Serf agent exited uncleanly");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_binary(binary: &str) -> GossipConfig {
        GossipConfig {
            binary: binary.to_string(),
            ..GossipConfig::default()
        }
    }

    #[test]
    fn test_count_members() {
        let doc = br#"{"members":[{"name":"a","addr":"10.0.0.1:7946","status":"alive"},{"name":"b"}]}"#;
        assert_eq!(count_members(doc).unwrap(), 2);

        assert_eq!(count_members(br#"{"members":[]}"#).unwrap(), 0);

        assert!(matches!(
            count_members(b"not json"),
            Err(MembershipError::Unavailable(_))
        ));
    }

    #[test]
    fn test_agent_args() {
        let agent = SerfAgent::new(GossipConfig {
            rpc_addr: Some("127.0.0.1:7373".to_string()),
            ..GossipConfig::default()
        });

        let args = agent.agent_args(Ipv4Addr::new(10, 147, 17, 4));
        assert_eq!(
            args,
            vec![
                "agent",
                "-bind=10.147.17.4",
                "-event-handler=user:new_torrent=cell pull",
                "-rpc-addr=127.0.0.1:7373",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let agent = SerfAgent::new(config_with_binary("serf"));
        assert!(agent.stop().await.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unreachable_agent_is_unavailable() {
        let agent = SerfAgent::new(config_with_binary("false"));

        assert!(matches!(
            agent.alive_count().await,
            Err(MembershipError::Unavailable(_))
        ));
        assert!(matches!(
            agent.join(Ipv4Addr::new(10, 0, 0, 2)).await,
            Err(MembershipError::JoinFailed { .. })
        ));
    }
}
