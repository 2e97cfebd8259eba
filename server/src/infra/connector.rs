//! Platform connectors referenced from devcontainer customizations

use async_trait::async_trait;

use crate::domain::devcontainer::ConnectorRef;
use crate::error::{Error, Result};

/// Credentials of a resolved connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorDetails {
    pub id: String,
    pub connector_type: String,
    /// Registry or service URL the connector authenticates against
    pub url: String,
    pub username: String,
    pub password: String,
}

impl ConnectorDetails {
    /// Whether this connector authenticates the registry of `image`
    pub fn matches_image(&self, image: &str) -> bool {
        let registry = self
            .url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        !registry.is_empty() && image.starts_with(registry)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn fetch_connectors(
        &self,
        space_path: &str,
        refs: &[ConnectorRef],
    ) -> Result<Vec<ConnectorDetails>>;
}

/// Connector source for deployments without a connector service
pub struct NoopConnector;

#[async_trait]
impl PlatformConnector for NoopConnector {
    async fn fetch_connectors(
        &self,
        space_path: &str,
        refs: &[ConnectorRef],
    ) -> Result<Vec<ConnectorDetails>> {
        match refs.first() {
            None => Ok(Vec::new()),
            Some(first) => Err(Error::ConnectorError(format!(
                "connector {} in space {} cannot be resolved: no connector service configured",
                first.id, space_path
            ))),
        }
    }
}
