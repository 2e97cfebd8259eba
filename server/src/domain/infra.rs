//! Provisioned infrastructure descriptors

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Infra provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraProviderType {
    Docker,
}

impl InfraProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraProviderType::Docker => "docker",
        }
    }
}

/// Infra lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraStatus {
    Pending,
    Provisioned,
    Stopped,
    Destroyed,
    Error,
    Unknown,
}

impl InfraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraStatus::Pending => "pending",
            InfraStatus::Provisioned => "provisioned",
            InfraStatus::Stopped => "stopped",
            InfraStatus::Destroyed => "destroyed",
            InfraStatus::Error => "error",
            InfraStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InfraStatus::Pending),
            "provisioned" => Some(InfraStatus::Provisioned),
            "stopped" => Some(InfraStatus::Stopped),
            "destroyed" => Some(InfraStatus::Destroyed),
            "error" => Some(InfraStatus::Error),
            "unknown" => Some(InfraStatus::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for InfraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a status set the way errors report it
pub fn format_statuses(statuses: &[InfraStatus]) -> String {
    let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    format!("[{}]", names.join(" "))
}

/// Host side of a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port published on the host; 0 lets the engine pick one
    pub published_port: u16,
    /// Port forwarded through a proxy, if any
    pub forwarded_port: u16,
}

/// Provisioned compute for one gitspace instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Infrastructure {
    pub identifier: String,
    pub space_path: String,
    pub gitspace_config_identifier: String,
    pub gitspace_instance_identifier: String,
    pub provider_type: InfraProviderType,
    pub provider_resource: String,
    /// Host the engine runs on
    pub agent_host: String,
    /// Port of the engine API when reached over TCP
    pub agent_port: u16,
    /// Host advertised in IDE URLs
    pub gitspace_host: String,
    /// Proxy host preferred over the gitspace host when set
    pub proxy_host: Option<String>,
    /// Container port to host mapping
    pub port_mappings: HashMap<u16, PortMapping>,
    /// Named volume holding the user's home directory
    pub storage_identifier: String,
    pub status: InfraStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Infrastructure {
    /// Host used when building IDE URLs
    pub fn url_host(&self) -> &str {
        match self.proxy_host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => &self.gitspace_host,
        }
    }
}
