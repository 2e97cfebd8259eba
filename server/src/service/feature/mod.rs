//! Devcontainer features: download, option resolution and install order

pub mod download;
pub mod resolve;
pub mod sort;

use tokio_util::sync::CancellationToken;

pub use download::{FeatureDownloader, FeatureFetcher, RegistryFetcher};
pub use resolve::{calculate_digest, resolve_features};
pub use sort::sort_features;

use crate::domain::devcontainer::DevcontainerConfig;
use crate::domain::feature::ResolvedFeature;
use crate::error::Result;
use crate::service::logger::{log_and_wrap, GitspaceLogger};

/// Download, resolve and order the features of `devcontainer`
pub async fn install_order(
    downloader: &FeatureDownloader,
    instance_identifier: &str,
    devcontainer: &DevcontainerConfig,
    logger: &dyn GitspaceLogger,
    cancel: &CancellationToken,
) -> Result<Vec<ResolvedFeature>> {
    let Some(features) = devcontainer.features.as_ref().filter(|f| !f.is_empty()) else {
        return Ok(Vec::new());
    };

    logger.info(&format!("Downloading {} features", features.len()));
    let downloaded = downloader
        .download_features(instance_identifier, features, cancel)
        .await
        .map_err(|e| log_and_wrap(logger, "Error downloading features", e))?;

    let resolved = resolve_features(features, &downloaded)
        .map_err(|e| log_and_wrap(logger, "Error resolving features", e))?;

    let sorted = sort_features(&resolved, &devcontainer.override_feature_install_order)
        .map_err(|e| log_and_wrap(logger, "Error sorting features", e))?;

    let order: Vec<String> = sorted.iter().map(ResolvedFeature::print).collect();
    logger.info(&format!("Feature install order:\n{}", order.join("\n")));

    Ok(sorted)
}
