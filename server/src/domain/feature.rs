//! Devcontainer feature model

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::devcontainer::{deserialize_mounts, FeatureValue, LifecycleCommand, Mount};
use crate::error::{Error, Result};

/// Tag used when a source does not carry one
pub const FEATURE_DEFAULT_TAG: &str = "latest";

/// Where a feature is fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSourceType {
    Oci,
    Tarball,
}

impl FeatureSourceType {
    /// Classify a feature key from devcontainer.json
    pub fn detect(source: &str) -> Result<Self> {
        if source.starts_with("https://") || source.starts_with("http://") {
            return Ok(FeatureSourceType::Tarball);
        }
        if source.starts_with("./") || source.starts_with("../") || source.starts_with('/') {
            return Err(Error::FeatureResolution(format!(
                "local features are not supported: {}",
                source
            )));
        }
        Ok(FeatureSourceType::Oci)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureSourceType::Oci => "oci",
            FeatureSourceType::Tarball => "tarball",
        }
    }
}

/// A feature option value supplied by a user or a default
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureOptionValue {
    Bool(bool),
    String(String),
}

impl std::fmt::Display for FeatureOptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureOptionValue::Bool(b) => write!(f, "{}", b),
            FeatureOptionValue::String(s) => f.write_str(s),
        }
    }
}

/// Option schema declared in devcontainer-feature.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeatureOption {
    #[serde(rename = "boolean")]
    Boolean {
        #[serde(default)]
        default: Option<bool>,
        #[serde(default)]
        description: Option<String>,
    },
    #[serde(rename = "string")]
    String {
        #[serde(default)]
        default: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        r#enum: Option<Vec<String>>,
        #[serde(default)]
        proposals: Option<Vec<String>>,
    },
}

impl FeatureOption {
    /// Default value rendered as a string; missing defaults become empty/false
    pub fn default_value(&self) -> String {
        match self {
            FeatureOption::Boolean { default, .. } => default.unwrap_or(false).to_string(),
            FeatureOption::String { default, .. } => default.clone().unwrap_or_default(),
        }
    }

    /// Validate a user value and render it as a string
    pub fn validate_value(&self, value: &FeatureOptionValue) -> std::result::Result<String, String> {
        match (self, value) {
            (FeatureOption::Boolean { .. }, FeatureOptionValue::Bool(b)) => Ok(b.to_string()),
            (FeatureOption::Boolean { .. }, FeatureOptionValue::String(s)) => {
                match s.as_str() {
                    "true" | "false" => Ok(s.clone()),
                    _ => Err(format!("expected a boolean, got {:?}", s)),
                }
            }
            (FeatureOption::String { r#enum, .. }, value) => {
                let rendered = value.to_string();
                match r#enum {
                    Some(allowed) if !allowed.contains(&rendered) => Err(format!(
                        "value {:?} is not one of the allowed values: {:?}",
                        rendered, allowed
                    )),
                    _ => Ok(rendered),
                }
            }
        }
    }
}

/// devcontainer-feature.json
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevcontainerFeatureConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, FeatureOption>,
    #[serde(default)]
    pub depends_on: BTreeMap<String, FeatureValue>,
    #[serde(default)]
    pub installs_after: Vec<String>,
    #[serde(default)]
    pub container_env: HashMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_mounts")]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub post_create_command: LifecycleCommand,
    #[serde(default)]
    pub post_start_command: LifecycleCommand,
}

impl DevcontainerFeatureConfig {
    /// Parse devcontainer-feature.json content, tolerating comments
    pub fn from_jsonc(content: &str) -> Result<Self> {
        let raw: serde_json::Value = json5::from_str(content)
            .map_err(|e| Error::FeatureDownload(format!("invalid devcontainer-feature.json: {}", e)))?;
        Ok(serde_json::from_value(raw)?)
    }
}

/// A feature fetched and unpacked on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedFeature {
    pub feature_folder_name: String,
    /// Source as written by the user
    pub source: String,
    pub source_without_tag: String,
    pub tag: String,
    /// Registry digest for OCI sources, the URL itself for tarballs
    pub canonical_name: String,
    /// Directory holding the unpacked feature
    pub directory: String,
    pub devcontainer_feature_config: DevcontainerFeatureConfig,
}

/// A feature after option resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFeature {
    /// Final option values keyed by option name
    pub resolved_options: BTreeMap<String, String>,
    /// Options the user supplied
    pub override_options: BTreeMap<String, FeatureOptionValue>,
    /// sha256 over source and options
    pub digest: String,
    pub downloaded_feature: Arc<DownloadedFeature>,
}

impl ResolvedFeature {
    /// One-line description used in install order logs
    pub fn print(&self) -> String {
        let options: Vec<String> = self
            .resolved_options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!(
            "{} {} options: [{}]",
            self.downloaded_feature.source,
            self.downloaded_feature.canonical_name,
            options.join(", ")
        )
    }
}

/// Split an OCI reference into the part without tag and the tag.
///
/// A digest reference (`repo@sha256:...`) yields the digest as its tag.
pub fn split_oci_source(source: &str) -> (String, String) {
    if let Some((reference, digest)) = source.split_once('@') {
        return (reference.to_string(), digest.to_string());
    }
    let base_start = source.rfind('/').map(|i| i + 1).unwrap_or(0);
    match source[base_start..].find(':') {
        Some(idx) => (
            source[..base_start + idx].to_string(),
            source[base_start + idx + 1..].to_string(),
        ),
        None => (source.to_string(), FEATURE_DEFAULT_TAG.to_string()),
    }
}

/// Strip the tag from any feature key, used for installsAfter and override order matching
pub fn source_without_tag(source: &str) -> String {
    match FeatureSourceType::detect(source) {
        Ok(FeatureSourceType::Oci) => split_oci_source(source).0,
        _ => source.to_string(),
    }
}
