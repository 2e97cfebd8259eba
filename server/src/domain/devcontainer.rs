//! Parsed devcontainer.json

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::feature::FeatureOptionValue;
use crate::error::{Error, Result};

/// `postCreateCommand` / `postStartCommand` in any of the accepted shapes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum LifecycleCommand {
    #[default]
    None,
    Command(String),
    Args(Vec<String>),
    /// Named commands, run in key order
    Parallel(BTreeMap<String, LifecycleCommandEntry>),
}

/// One entry of a named lifecycle command map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LifecycleCommandEntry {
    Command(String),
    Args(Vec<String>),
}

impl LifecycleCommandEntry {
    fn to_command(&self) -> String {
        match self {
            LifecycleCommandEntry::Command(cmd) => cmd.clone(),
            LifecycleCommandEntry::Args(args) => args.join(" "),
        }
    }
}

impl LifecycleCommand {
    /// Flatten into shell command lines
    pub fn to_command_array(&self) -> Vec<String> {
        let commands = match self {
            LifecycleCommand::None => Vec::new(),
            LifecycleCommand::Command(cmd) => vec![cmd.clone()],
            LifecycleCommand::Args(args) => vec![args.join(" ")],
            LifecycleCommand::Parallel(entries) => {
                entries.values().map(LifecycleCommandEntry::to_command).collect()
            }
        };
        commands
            .into_iter()
            .filter(|cmd| !cmd.trim().is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.to_command_array().is_empty()
    }
}

/// A mount declared by devcontainer.json, a feature, image metadata or a run arg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type", default)]
    pub mount_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
}

impl Mount {
    /// Parse the docker `--mount` string form, e.g. `type=volume,source=cache,target=/cache`
    pub fn parse(raw: &str) -> Result<Self> {
        let mut mount = Mount {
            mount_type: String::new(),
            source: String::new(),
            target: String::new(),
        };

        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            match key {
                "type" => mount.mount_type = value.to_string(),
                "source" | "src" => mount.source = value.to_string(),
                "target" | "destination" | "dst" => mount.target = value.to_string(),
                _ => {}
            }
        }

        if mount.target.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "mount {raw:?} does not declare a target"
            )));
        }
        Ok(mount)
    }

    /// Parse a JSON value that is either the string form or an object
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(raw) => Self::parse(raw),
            serde_json::Value::Object(_) => Ok(serde_json::from_value(value.clone())?),
            other => Err(Error::InvalidParameter(format!(
                "unsupported mount definition: {other}"
            ))),
        }
    }
}

pub(crate) fn deserialize_mounts<'de, D>(deserializer: D) -> std::result::Result<Vec<Mount>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    values
        .iter()
        .map(|value| Mount::from_value(value).map_err(serde::de::Error::custom))
        .collect()
}

/// `forwardPorts` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForwardPort {
    Port(u16),
    /// `host:port` form, only the port is used
    HostPort(String),
}

impl ForwardPort {
    pub fn port(&self) -> Option<u16> {
        match self {
            ForwardPort::Port(port) => Some(*port),
            ForwardPort::HostPort(raw) => raw.rsplit(':').next()?.parse().ok(),
        }
    }
}

/// User-declared feature value: a version string, a boolean or an options object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Options(BTreeMap<String, FeatureOptionValue>),
    Version(String),
    Enabled(bool),
}

impl FeatureValue {
    /// Option overrides carried by the value
    pub fn options(&self) -> BTreeMap<String, FeatureOptionValue> {
        match self {
            FeatureValue::Options(options) => options.clone(),
            FeatureValue::Version(_) | FeatureValue::Enabled(_) => BTreeMap::new(),
        }
    }
}

/// Map of feature source to its user value
pub type Features = BTreeMap<String, FeatureValue>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsCodeCustomizations {
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetBrainsCustomizations {
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Backend download URL override
    #[serde(default)]
    pub backend_download_url: Option<String>,
}

/// Reference to a platform connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorRef {
    pub id: String,
    #[serde(rename = "type", default)]
    pub connector_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitspaceCustomizations {
    #[serde(default)]
    pub connectors: Vec<ConnectorRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Customizations {
    #[serde(default)]
    pub vscode: Option<VsCodeCustomizations>,
    #[serde(default)]
    pub jetbrains: Option<JetBrainsCustomizations>,
    #[serde(default)]
    pub gitspace: Option<GitspaceCustomizations>,
}

/// devcontainer.json as used by the container orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevcontainerConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container_env: HashMap<String, String>,
    #[serde(default)]
    pub forward_ports: Vec<ForwardPort>,
    #[serde(default)]
    pub post_create_command: LifecycleCommand,
    #[serde(default)]
    pub post_start_command: LifecycleCommand,
    #[serde(default)]
    pub run_args: Vec<String>,
    #[serde(default)]
    pub features: Option<Features>,
    #[serde(default)]
    pub override_feature_install_order: Vec<String>,
    #[serde(default)]
    pub customizations: Customizations,
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub container_user: Option<String>,
    #[serde(default, deserialize_with = "deserialize_mounts")]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub init: Option<bool>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
}

impl DevcontainerConfig {
    /// Parse devcontainer.json content, accepting comments and trailing commas
    pub fn from_jsonc(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: serde_json::Value = json5::from_str(content)
            .map_err(|e| Error::ScmError(format!("failed to parse devcontainer.json: {}", e)))?;
        serde_json::from_value(raw)
            .map_err(|e| Error::ScmError(format!("invalid devcontainer.json: {}", e)))
    }

    /// Ports listed in `forwardPorts`
    pub fn forward_ports(&self) -> Vec<u16> {
        self.forward_ports.iter().filter_map(ForwardPort::port).collect()
    }

    /// Image to run, falling back to the configured default
    pub fn image_or<'a>(&'a self, default_base_image: &'a str) -> &'a str {
        match self.image.as_deref() {
            Some(image) if !image.is_empty() => image,
            _ => default_base_image,
        }
    }

    pub fn has_features(&self) -> bool {
        self.features.as_ref().is_some_and(|f| !f.is_empty())
    }

    pub fn connector_refs(&self) -> Vec<ConnectorRef> {
        self.customizations
            .gitspace
            .as_ref()
            .map(|g| g.connectors.clone())
            .unwrap_or_default()
    }
}
