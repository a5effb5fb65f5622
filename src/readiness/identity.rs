//! Identity material written by the ZeroTier daemon

use std::io::ErrorKind;
use std::path::PathBuf;

use super::{IdentitySource, NodeIdentity, Readiness, ReadinessError};

/// Reads the member id from `identity.public`.
///
/// A missing or empty file is not ready yet, since the daemon creates the
/// file before it writes the key pair. Only content without a member id
/// separator is malformed.
pub struct IdentityFile {
    path: PathBuf,
}

impl IdentityFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl IdentitySource for IdentityFile {
    async fn read_identity(&self) -> Result<Readiness<NodeIdentity>, ReadinessError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Readiness::NotReady),
            Err(e) => return Err(ReadinessError::Io(e)),
        };

        if content.trim().is_empty() {
            return Ok(Readiness::NotReady);
        }

        NodeIdentity::parse(&content).map(Readiness::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let source = IdentityFile::new(dir.path().join("identity.public"));

        assert_eq!(source.read_identity().await.unwrap(), Readiness::NotReady);
    }

    #[tokio::test]
    async fn test_empty_file_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.public");
        std::fs::write(&path, "").unwrap();

        let source = IdentityFile::new(path);
        assert_eq!(source.read_identity().await.unwrap(), Readiness::NotReady);
    }

    #[tokio::test]
    async fn test_reads_member_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.public");
        std::fs::write(&path, "8056c2e21c:0:9f2c6a0b5e\n").unwrap();

        let source = IdentityFile::new(path);
        let identity = source.read_identity().await.unwrap();

        assert_eq!(
            identity,
            Readiness::Ready(NodeIdentity::parse("8056c2e21c:x").unwrap())
        );
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.public");
        std::fs::write(&path, "garbage").unwrap();

        let source = IdentityFile::new(path);
        assert!(matches!(
            source.read_identity().await,
            Err(ReadinessError::Malformed(_))
        ));
    }
}
