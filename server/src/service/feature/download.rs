//! Feature download
//!
//! Features are fetched concurrently. Each finished download may declare
//! further dependencies, which are queued until the dependency closure has
//! been fetched.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::devcontainer::Features;
use crate::domain::feature::{
    split_oci_source, DevcontainerFeatureConfig, DownloadedFeature, FeatureSourceType,
    FEATURE_DEFAULT_TAG,
};
use crate::error::{Error, FeatureErrors, Result};

/// Downloads in flight at once
const MAX_CONCURRENT_DOWNLOADS: usize = 100;

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const FEATURE_MANIFEST_FILE: &str = "devcontainer-feature.json";

/// Raw archive of one feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureArchive {
    /// Tar or gzipped tar bytes
    pub bytes: Vec<u8>,
    /// Registry digest for OCI sources, the URL for tarballs
    pub canonical_name: String,
}

/// Fetches feature archives from registries and URLs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeatureFetcher: Send + Sync {
    async fn fetch(&self, source: &str, source_type: FeatureSourceType) -> Result<FeatureArchive>;
}

#[derive(Debug, Deserialize)]
struct OciDescriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct OciManifest {
    layers: Vec<OciDescriptor>,
}

/// Fetcher speaking the OCI distribution API and plain HTTP
pub struct RegistryFetcher {
    client: reqwest::Client,
}

impl RegistryFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Exchange a `Bearer` challenge for an anonymous token
    async fn exchange_token(&self, challenge: &str) -> Result<String> {
        let params = challenge.strip_prefix("Bearer ").ok_or_else(|| {
            Error::FeatureDownload(format!("unsupported registry challenge: {}", challenge))
        })?;

        let mut realm = None;
        let mut query = Vec::new();
        for param in params.split(',') {
            if let Some((key, value)) = param.trim().split_once('=') {
                let value = value.trim_matches('"');
                match key {
                    "realm" => realm = Some(value.to_string()),
                    "service" | "scope" => query.push((key.to_string(), value.to_string())),
                    _ => {}
                }
            }
        }
        let realm = realm.ok_or_else(|| {
            Error::FeatureDownload("missing realm in registry challenge".to_string())
        })?;

        debug!("Exchanging for anonymous token at: {}", realm);
        let token: serde_json::Value = self
            .client
            .get(&realm)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        token
            .get("token")
            .or_else(|| token.get("access_token"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::FeatureDownload("token not found in registry response".to_string()))
    }

    /// GET with a single retry through the registry token flow
    async fn registry_get(&self, url: &str, accept: Option<&str>, token: &mut Option<String>) -> Result<Vec<u8>> {
        let send = |token: Option<&str>| {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            request.send()
        };

        let mut response = send(token.as_deref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let fresh = self.exchange_token(&challenge).await?;
            response = send(Some(&fresh)).await?;
            *token = Some(fresh);
        }

        if !response.status().is_success() {
            return Err(Error::FeatureDownload(format!(
                "GET {} failed with HTTP status {}",
                url,
                response.status().as_u16()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn fetch_oci(&self, source: &str) -> Result<FeatureArchive> {
        let (reference, tag) = split_oci_source(source);
        let (registry, repository) = reference
            .split_once('/')
            .ok_or_else(|| Error::FeatureDownload(format!("invalid oci repo: {}", source)))?;

        let mut token = None;
        let manifest_url = format!("https://{}/v2/{}/manifests/{}", registry, repository, tag);
        debug!("Fetching manifest from: {}", manifest_url);
        let manifest_bytes = self
            .registry_get(&manifest_url, Some(OCI_MANIFEST_MEDIA_TYPE), &mut token)
            .await?;
        let manifest: OciManifest = serde_json::from_slice(&manifest_bytes)?;
        let layer = manifest
            .layers
            .first()
            .ok_or_else(|| Error::FeatureDownload(format!("no layers found in manifest of {}", source)))?;

        let blob_url = format!("https://{}/v2/{}/blobs/{}", registry, repository, layer.digest);
        let bytes = self.registry_get(&blob_url, None, &mut token).await?;

        Ok(FeatureArchive {
            bytes,
            canonical_name: format!("sha256:{:x}", Sha256::digest(&manifest_bytes)),
        })
    }

    async fn fetch_tarball(&self, url: &str) -> Result<FeatureArchive> {
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(Error::FeatureDownload(format!(
                "failed to download tarball: HTTP status {}",
                response.status().as_u16()
            )));
        }
        Ok(FeatureArchive {
            bytes: response.bytes().await?.to_vec(),
            canonical_name: url.to_string(),
        })
    }
}

impl Default for RegistryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeatureFetcher for RegistryFetcher {
    async fn fetch(&self, source: &str, source_type: FeatureSourceType) -> Result<FeatureArchive> {
        match source_type {
            FeatureSourceType::Oci => self.fetch_oci(source).await,
            FeatureSourceType::Tarball => self.fetch_tarball(source).await,
        }
    }
}

/// Naming of a feature on disk
struct FeatureLayout {
    folder_name: String,
    source_without_tag: String,
    tag: String,
}

impl FeatureLayout {
    fn for_source(source: &str, source_type: FeatureSourceType) -> Result<Self> {
        match source_type {
            FeatureSourceType::Oci => {
                let (source_without_tag, tag) = split_oci_source(source);
                let base = source_without_tag
                    .rsplit('/')
                    .next()
                    .unwrap_or(&source_without_tag)
                    .to_string();
                Ok(Self {
                    folder_name: format!("devcontainer-feature-{}", base),
                    source_without_tag,
                    tag,
                })
            }
            FeatureSourceType::Tarball => {
                let url = reqwest::Url::parse(source).map_err(|e| {
                    Error::FeatureDownload(format!("error parsing feature URL for feature {}: {}", source, e))
                })?;
                let file_name = url
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| Error::FeatureDownload(format!("feature URL has no file name: {}", source)))?;
                Ok(Self {
                    folder_name: file_name
                        .trim_end_matches(".tgz")
                        .trim_end_matches(".tar.gz")
                        .to_string(),
                    source_without_tag: source.to_string(),
                    tag: FEATURE_DEFAULT_TAG.to_string(),
                })
            }
        }
    }
}

/// Unpack a tar or gzipped tar archive into `dst`.
///
/// Only regular files and directories are accepted.
pub fn unpack_archive(bytes: &[u8], dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;

    let reader: Box<dyn Read + '_> = if bytes.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(bytes))
    } else {
        Box::new(bytes)
    };

    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            return Err(Error::FeatureDownload(format!(
                "unsupported entry type {:?} in {}",
                kind,
                entry.path()?.display()
            )));
        }
        entry.unpack_in(dst)?;
    }
    Ok(())
}

/// Downloads the dependency closure of a feature set into a per-instance directory
pub struct FeatureDownloader {
    fetcher: Arc<dyn FeatureFetcher>,
    base_dir: PathBuf,
}

impl FeatureDownloader {
    pub fn new(fetcher: Arc<dyn FeatureFetcher>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            base_dir: base_dir.into(),
        }
    }

    /// Root of the downloads of one gitspace instance
    pub fn instance_dir(&self, instance_identifier: &str) -> PathBuf {
        self.base_dir
            .join(instance_identifier)
            .join("devcontainer-features")
    }

    /// Download every feature in `features` and, transitively, their `dependsOn`.
    ///
    /// Failures of individual downloads are collected and returned together
    /// once all downloads have finished.
    pub async fn download_features(
        &self,
        instance_identifier: &str,
        features: &Features,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Arc<DownloadedFeature>>> {
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS));
        let root = self.instance_dir(instance_identifier);

        let mut queued: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<Result<DownloadedFeature>> = JoinSet::new();
        let mut downloaded = HashMap::new();
        let mut errors: Vec<Error> = Vec::new();

        for source in features.keys() {
            queued.insert(source.clone());
            self.spawn_download(&mut tasks, source.clone(), root.clone(), permits.clone());
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            match joined.map_err(Error::from).and_then(|r| r) {
                Ok(feature) => {
                    for dependency in feature.devcontainer_feature_config.depends_on.keys() {
                        if queued.insert(dependency.clone()) {
                            debug!("Queueing dependency {} of {}", dependency, feature.source);
                            self.spawn_download(&mut tasks, dependency.clone(), root.clone(), permits.clone());
                        }
                    }
                    downloaded.insert(feature.source.clone(), Arc::new(feature));
                }
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(Error::FeatureDownloads(FeatureErrors(errors)));
        }

        info!(
            "Downloaded {} features for gitspace instance {}",
            downloaded.len(),
            instance_identifier
        );
        Ok(downloaded)
    }

    fn spawn_download(
        &self,
        tasks: &mut JoinSet<Result<DownloadedFeature>>,
        source: String,
        root: PathBuf,
        permits: Arc<Semaphore>,
    ) {
        let fetcher = self.fetcher.clone();
        tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            download_feature(fetcher.as_ref(), &source, &root).await
        });
    }
}

async fn download_feature(
    fetcher: &dyn FeatureFetcher,
    source: &str,
    root: &Path,
) -> Result<DownloadedFeature> {
    let source_type = FeatureSourceType::detect(source)?;
    let layout = FeatureLayout::for_source(source, source_type)?;

    let archive = fetcher.fetch(source, source_type).await.map_err(|e| {
        e.context(format!(
            "error downloading {} artifact for feature {}",
            source_type.as_str(),
            source
        ))
    })?;

    let directory = root
        .join(format!("{}-{}", layout.folder_name, layout.tag.replace(':', "-")))
        .join(&layout.folder_name);
    let unpack_dir = directory.clone();
    tokio::task::spawn_blocking(move || unpack_archive(&archive.bytes, &unpack_dir))
        .await?
        .map_err(|e| e.context(format!("error unpacking tarball for feature {}", source)))?;

    let manifest = tokio::fs::read_to_string(directory.join(FEATURE_MANIFEST_FILE))
        .await
        .map_err(|e| {
            Error::from(e).context(format!(
                "error reading {} file for feature {}",
                FEATURE_MANIFEST_FILE, source
            ))
        })?;
    let config = DevcontainerFeatureConfig::from_jsonc(&manifest)
        .map_err(|e| e.context(format!("error parsing {} for feature {}", FEATURE_MANIFEST_FILE, source)))?;

    Ok(DownloadedFeature {
        feature_folder_name: layout.folder_name,
        source: source.to_string(),
        source_without_tag: layout.source_without_tag,
        tag: layout.tag,
        canonical_name: archive.canonical_name,
        directory: directory.to_string_lossy().into_owned(),
        devcontainer_feature_config: config,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Build a tar archive holding a feature manifest and install script
    pub fn feature_archive(manifest: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in [
            (FEATURE_MANIFEST_FILE, manifest),
            ("install.sh", "#!/bin/sh\necho installing\n"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    use super::testing::feature_archive;
    use super::*;
    use crate::domain::devcontainer::FeatureValue;

    const NODE: &str = "ghcr.io/devcontainers/features/node:1";
    const COMMON: &str = "ghcr.io/devcontainers/features/common-utils:2";

    fn fetcher() -> MockFeatureFetcher {
        let mut fetcher = MockFeatureFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|source, _| source.to_string() == NODE)
            .times(1)
            .returning(|_, _| {
                Ok(FeatureArchive {
                    bytes: feature_archive(&format!(
                        r#"{{
                            // node feature
                            "id": "node",
                            "dependsOn": {{ "{}": {{}} }}
                        }}"#,
                        COMMON
                    )),
                    canonical_name: "sha256:node".to_string(),
                })
            });
        fetcher
            .expect_fetch()
            .withf(|source, _| source.to_string() == COMMON)
            .times(1)
            .returning(|_, _| {
                Ok(FeatureArchive {
                    bytes: feature_archive(r#"{ "id": "common-utils" }"#),
                    canonical_name: "sha256:common".to_string(),
                })
            });
        fetcher
    }

    #[tokio::test]
    async fn test_downloads_dependency_closure() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = FeatureDownloader::new(Arc::new(fetcher()), dir.path());
        let features = BTreeMap::from([(NODE.to_string(), FeatureValue::Version("1".to_string()))]);

        let downloaded = downloader
            .download_features("app-0000aaaa", &features, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downloaded.len(), 2);
        let node = &downloaded[NODE];
        assert_eq!(node.feature_folder_name, "devcontainer-feature-node");
        assert_eq!(node.source_without_tag, "ghcr.io/devcontainers/features/node");
        assert_eq!(node.tag, "1");
        assert_eq!(node.canonical_name, "sha256:node");
        assert!(Path::new(&node.directory).join("install.sh").exists());
        assert!(node.directory.contains("app-0000aaaa"));
        assert_eq!(downloaded[COMMON].devcontainer_feature_config.id, "common-utils");
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MockFeatureFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|source, _| Err(Error::FeatureDownload(format!("{} unreachable", source))));
        let downloader = FeatureDownloader::new(Arc::new(fetcher), dir.path());
        let features = BTreeMap::from([
            (NODE.to_string(), FeatureValue::Enabled(true)),
            (COMMON.to_string(), FeatureValue::Enabled(true)),
        ]);

        let err = downloader
            .download_features("app-0000aaaa", &features, &CancellationToken::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("node:1 unreachable"));
        assert!(message.contains("common-utils:2 unreachable"));

        let Error::FeatureDownloads(FeatureErrors(errors)) = &err else {
            panic!("expected aggregated download errors, got {:?}", err);
        };
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| matches!(e.root(), Error::FeatureDownload(m) if m.ends_with("unreachable"))));
        assert!(std::error::Error::source(&err).is_some());
    }

    /// Fetcher whose downloads never complete
    struct StalledFetcher;

    #[async_trait]
    impl FeatureFetcher for StalledFetcher {
        async fn fetch(&self, _source: &str, _source_type: FeatureSourceType) -> Result<FeatureArchive> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = FeatureDownloader::new(Arc::new(StalledFetcher), dir.path());
        let features = BTreeMap::from([(NODE.to_string(), FeatureValue::Enabled(true))]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            downloader.download_features("app-0000aaaa", &features, &cancel),
        )
        .await
        .expect("download did not stop after cancel");
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancelled_token_wins_over_empty_feature_set() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = FeatureDownloader::new(Arc::new(MockFeatureFetcher::new()), dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = downloader
            .download_features("app-0000aaaa", &BTreeMap::new(), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_unpack_gzipped_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&feature_archive(r#"{ "id": "go" }"#))
            .unwrap();
        let gz = encoder.finish().unwrap();

        unpack_archive(&gz, dir.path()).unwrap();
        assert!(dir.path().join(FEATURE_MANIFEST_FILE).exists());
    }

    #[test]
    fn test_digest_reference_layout() {
        let layout = FeatureLayout::for_source(
            "ghcr.io/devcontainers/features/go@sha256:0f3a9c",
            FeatureSourceType::Oci,
        )
        .unwrap();
        assert_eq!(layout.folder_name, "devcontainer-feature-go");
        assert_eq!(layout.source_without_tag, "ghcr.io/devcontainers/features/go");
        assert_eq!(layout.tag, "sha256:0f3a9c");
    }

    #[test]
    fn test_tarball_layout() {
        let layout = FeatureLayout::for_source(
            "https://example.com/features/devcontainer-feature-go.tgz",
            FeatureSourceType::Tarball,
        )
        .unwrap();
        assert_eq!(layout.folder_name, "devcontainer-feature-go");
        assert_eq!(layout.tag, FEATURE_DEFAULT_TAG);
    }
}
