//! Node configuration
//!
//! Loaded from a TOML file (missing file means defaults), then overridden by
//! command line flags.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port every member listens on for discovery probes
pub const DISCOVERY_PORT: u16 = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

/// ZeroTier daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// ZeroTier home directory (holds identity.public)
    #[serde(default = "default_vpn_home")]
    pub home: PathBuf,

    /// Daemon binary, `<home>/zerotier-one` when unset
    #[serde(default)]
    pub daemon: Option<PathBuf>,

    /// Control CLI binary
    #[serde(default = "default_vpn_cli")]
    pub cli: String,

    /// Interface the virtual network shows up on
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl VpnConfig {
    pub fn daemon_path(&self) -> PathBuf {
        self.daemon
            .clone()
            .unwrap_or_else(|| self.home.join("zerotier-one"))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.home.join("identity.public")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            home: default_vpn_home(),
            daemon: None,
            cli: default_vpn_cli(),
            interface: default_interface(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Serf agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Serf binary
    #[serde(default = "default_serf_binary")]
    pub binary: String,

    /// RPC address passed to every serf command
    #[serde(default)]
    pub rpc_addr: Option<String>,

    /// `-event-handler` values for the agent
    #[serde(default = "default_event_handlers")]
    pub event_handlers: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            binary: default_serf_binary(),
            rpc_addr: None,
            event_handlers: default_event_handlers(),
        }
    }
}

/// Multicast discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Multicast group shared by the cluster
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,

    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Multicast TTL of probes (hops)
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,

    /// Type-of-service byte of probes
    #[serde(default)]
    pub tos: u8,

    /// Wait between probes while alone, in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Wait before re-asking an unreachable gossip agent, in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Minimum time between two joins of the same sender, in milliseconds
    #[serde(default = "default_join_cooldown")]
    pub join_cooldown_ms: u64,

    /// Give up on joining a discovered peer after this many milliseconds
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,

    /// Keep probing after convergence whenever the node finds itself alone
    #[serde(default)]
    pub rediscover: bool,
}

impl DiscoveryConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn join_cooldown(&self) -> Duration {
        Duration::from_millis(self.join_cooldown_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_discovery_port(),
            multicast_ttl: default_multicast_ttl(),
            tos: 0,
            probe_interval_ms: default_probe_interval(),
            retry_interval_ms: default_retry_interval(),
            join_cooldown_ms: default_join_cooldown(),
            join_timeout_ms: default_join_timeout(),
            rediscover: false,
        }
    }
}

/// ZeroTier Central API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API token; self-authorization is skipped without one
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: None,
            timeout_secs: default_api_timeout(),
        }
    }
}

/// Deluge client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_deluge_console")]
    pub console: String,

    /// Where pulled torrents land, a fresh temp dir per pull when unset
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            console: default_deluge_console(),
            download_dir: None,
        }
    }
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub interface: Option<String>,
    pub group: Option<Ipv4Addr>,
    pub token: Option<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Discovery group {0} is not a multicast address")]
    NotMulticast(Ipv4Addr),
}

impl Config {
    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(interface) = overrides.interface {
            self.vpn.interface = interface;
        }
        if let Some(group) = overrides.group {
            self.discovery.group = group;
        }
        if let Some(token) = overrides.token {
            self.authorization.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.discovery.group.is_multicast() {
            return Err(ConfigError::NotMulticast(self.discovery.group));
        }
        Ok(())
    }
}

// Defaults
fn default_vpn_home() -> PathBuf { PathBuf::from("/var/lib/zerotier-one") }
fn default_vpn_cli() -> String { "zerotier-cli".to_string() }
fn default_interface() -> String { "zt0".to_string() }
fn default_poll_interval() -> u64 { 1000 }
fn default_serf_binary() -> String { "serf".to_string() }
fn default_event_handlers() -> Vec<String> {
    vec!["user:new_torrent=cell pull".to_string()]
}
fn default_group() -> Ipv4Addr { Ipv4Addr::new(224, 0, 0, 250) }
fn default_discovery_port() -> u16 { DISCOVERY_PORT }
fn default_multicast_ttl() -> u32 { 2 }
fn default_probe_interval() -> u64 { 10_000 }
fn default_retry_interval() -> u64 { 2_000 }
fn default_join_cooldown() -> u64 { 10_000 }
fn default_join_timeout() -> u64 { 10_000 }
fn default_api_url() -> String { "https://my.zerotier.com/api".to_string() }
fn default_api_timeout() -> u64 { 30 }
fn default_deluge_console() -> String { "deluge-console".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config.vpn.interface, "zt0");
        assert_eq!(config.discovery.group, Ipv4Addr::new(224, 0, 0, 250));
        assert_eq!(config.discovery.port, 1024);
        assert_eq!(config.discovery.multicast_ttl, 2);
        assert_eq!(config.discovery.tos, 0);
        assert_eq!(config.discovery.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.discovery.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.discovery.join_timeout(), Duration::from_secs(10));
        assert_eq!(config.vpn.poll_interval(), Duration::from_secs(1));
        assert!(!config.discovery.rediscover);
        assert!(config.authorization.token.is_none());
    }

    #[test]
    fn test_daemon_path_derived_from_home() {
        let mut vpn = VpnConfig::default();
        vpn.home = PathBuf::from("/opt/zt");

        assert_eq!(vpn.daemon_path(), PathBuf::from("/opt/zt/zerotier-one"));
        assert_eq!(vpn.identity_path(), PathBuf::from("/opt/zt/identity.public"));

        vpn.daemon = Some(PathBuf::from("/usr/sbin/zerotier-one"));
        assert_eq!(vpn.daemon_path(), PathBuf::from("/usr/sbin/zerotier-one"));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = Config::from_toml(
            r#"
[vpn]
interface = "zt7"

[discovery]
group = "239.1.2.3"
"#,
        )
        .unwrap();

        config.apply_overrides(Overrides {
            interface: Some("ztabc".to_string()),
            group: None,
            token: Some("secret".to_string()),
        });

        assert_eq!(config.vpn.interface, "ztabc");
        assert_eq!(config.discovery.group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(config.authorization.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validate_rejects_unicast_group() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.discovery.group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotMulticast(_))
        ));
    }
}
