//! ZeroTier Central member authorization
//!
//! A node holding an API token can authorize itself on the network it joins,
//! so the controller hands out an address without manual approval.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AuthorizationConfig;
use crate::readiness::NodeIdentity;

/// Authorization errors
#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Member update rejected: HTTP {0}")]
    Rejected(u16),
}

/// Marks a member as authorized on a network
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, network: &str, member: &NodeIdentity) -> Result<(), AuthorizationError>;
}

/// Member update body
#[derive(Debug, Serialize)]
struct MemberUpdate {
    config: MemberConfig,
    annot: MemberAnnotation,
}

#[derive(Debug, Serialize)]
struct MemberConfig {
    authorized: bool,
}

#[derive(Debug, Serialize)]
struct MemberAnnotation {
    description: String,
}

/// Client for the ZeroTier Central REST API
pub struct CentralClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl CentralClient {
    /// Build a client from config; `None` when no token is configured
    pub fn from_config(config: &AuthorizationConfig) -> Result<Option<Self>, AuthorizationError> {
        let Some(token) = config.token.clone().filter(|t| !t.is_empty()) else {
            return Ok(None);
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AuthorizationError::Client(e.to_string()))?;

        Ok(Some(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        }))
    }

    fn member_url(&self, network: &str, member: &NodeIdentity) -> String {
        format!("{}/network/{}/member/{}", self.api_url, network, member)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait::async_trait]
impl Authorizer for CentralClient {
    async fn authorize(&self, network: &str, member: &NodeIdentity) -> Result<(), AuthorizationError> {
        let body = MemberUpdate {
            config: MemberConfig { authorized: true },
            annot: MemberAnnotation {
                description: format!("joined {}", local_hostname()),
            },
        };

        debug!(network, %member, "Authorizing member");
        let response = self
            .client
            .post(self.member_url(network, member))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthorizationError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthorizationError::Rejected(response.status().as_u16()));
        }

        info!(network, %member, "Member authorized");
        Ok(())
    }
}
