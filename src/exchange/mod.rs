//! File exchange over BitTorrent
//!
//! Members announce new content as a gossip user event carrying a torrent
//! URL. The agent's event handler runs `cell pull`, which hands the URL to the
//! local Deluge client.

use std::path::PathBuf;

use reqwest::Url;
use tracing::info;

use crate::config::ExchangeConfig;
use crate::process::{self, ProcessError};

/// Exchange errors
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Invalid torrent URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to create download directory {path}: {source}")]
    DownloadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Torrent client error: {0}")]
    Client(#[from] ProcessError),
}

/// Deluge driven through `deluge-console`
pub struct Deluge {
    console: String,
    download_dir: Option<PathBuf>,
}

impl Deluge {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            console: config.console.clone(),
            download_dir: config.download_dir.clone(),
        }
    }

    /// Add the torrent at `url` to the client.
    ///
    /// Returns the directory the content is downloaded to.
    pub async fn pull(&self, url: &str) -> Result<PathBuf, ExchangeError> {
        let url = parse_torrent_url(url)?;
        let dir = self.target_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ExchangeError::DownloadDir {
                path: dir.clone(),
                source,
            })?;

        info!(%url, dir = %dir.display(), "Adding torrent to client");
        let dir_arg = dir.display().to_string();
        process::run(&self.console, &["add", url.as_str(), "-p", dir_arg.as_str()]).await?;
        Ok(dir)
    }

    fn target_dir(&self) -> PathBuf {
        match &self.download_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join(format!("cell_pull_{}", uuid::Uuid::new_v4().simple())),
        }
    }
}

/// Parse a torrent URL as delivered by the event handler (surrounding
/// whitespace, including the trailing newline, is ignored)
pub fn parse_torrent_url(raw: &str) -> Result<Url, ExchangeError> {
    let trimmed = raw.trim();
    let invalid = |reason: String| ExchangeError::InvalidUrl {
        url: trimmed.to_string(),
        reason,
    };

    let url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" | "magnet" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_torrent_url() {
        let url = parse_torrent_url("http://10.147.17.4:8080/bench.torrent\n").unwrap();
        assert_eq!(url.as_str(), "http://10.147.17.4:8080/bench.torrent");

        assert!(parse_torrent_url("magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a").is_ok());

        assert!(matches!(
            parse_torrent_url(""),
            Err(ExchangeError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_torrent_url("file:///etc/passwd"),
            Err(ExchangeError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_fresh_dir_per_pull_without_config() {
        let deluge = Deluge::new(&ExchangeConfig::default());
        let first = deluge.target_dir();
        let second = deluge.target_dir();

        assert_ne!(first, second);
        assert!(first.starts_with(std::env::temp_dir()));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_pull_into_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("downloads");
        let deluge = Deluge::new(&ExchangeConfig {
            console: "true".to_string(),
            download_dir: Some(target.clone()),
        });

        let pulled = deluge.pull("http://10.147.17.4:8080/a.torrent").await.unwrap();
        assert_eq!(pulled, target);
        assert!(target.is_dir());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_client_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let deluge = Deluge::new(&ExchangeConfig {
            console: "false".to_string(),
            download_dir: Some(dir.path().to_path_buf()),
        });

        assert!(matches!(
            deluge.pull("http://10.147.17.4:8080/a.torrent").await,
            Err(ExchangeError::Client(ProcessError::Failed { .. }))
        ));
    }
}
