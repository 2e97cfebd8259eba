//! Server configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Database URL (SQLite)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Docker socket path; local defaults are used when unset
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Image used when the devcontainer config does not name one
    #[serde(default = "default_base_image")]
    pub default_base_image: String,

    /// Host advertised in IDE URLs for the local docker provider
    #[serde(default = "default_gitspace_host")]
    pub gitspace_host: String,

    /// Optional proxy host preferred over the gitspace host in IDE URLs
    #[serde(default)]
    pub proxy_host: Option<String>,

    /// How long a busy instance blocks new actions, in seconds
    #[serde(default = "default_busy_action_timeout")]
    pub busy_action_timeout_secs: u64,

    /// Upper bound for one asynchronous start/stop/reset, in seconds
    #[serde(default = "default_provisioning_timeout")]
    pub provisioning_timeout_secs: u64,

    /// How long a pending provision blocks a new one, in seconds
    #[serde(default = "default_infra_timeout")]
    pub infra_timeout_secs: u64,

    /// How long a delete waits for the instance to be cleaned up, in seconds
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_secs: u64,

    /// Poll interval while waiting for cleanup, in seconds
    #[serde(default = "default_cleanup_poll_interval")]
    pub cleanup_poll_interval_secs: u64,

    /// Period of the job that expires stuck instances, in seconds
    #[serde(default = "default_cleanup_job_interval")]
    pub cleanup_job_interval_secs: u64,

    /// Base directory for per-instance feature downloads
    #[serde(default = "default_feature_download_dir")]
    pub feature_download_dir: String,

    /// Scratch directory for devcontainer lookups in cloned repositories
    #[serde(default = "default_scm_work_dir")]
    pub scm_work_dir: String,

    /// Handlers running concurrently per event reader group
    #[serde(default = "default_event_concurrency")]
    pub event_concurrency: usize,

    /// Retries for a failed event handler
    #[serde(default = "default_event_max_retries")]
    pub event_max_retries: u32,

    /// Idle time after which a reader logs that its topic is quiet, in seconds
    #[serde(default = "default_event_idle_timeout")]
    pub event_idle_timeout_secs: u64,

    /// Log output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3000
}

fn default_database_url() -> String {
    "sqlite:data/gitspace.db?mode=rwc".to_string()
}

fn default_base_image() -> String {
    "mcr.microsoft.com/devcontainers/base:dev-ubuntu-24.04".to_string()
}

fn default_gitspace_host() -> String {
    "localhost".to_string()
}

fn default_busy_action_timeout() -> u64 {
    3600 // 1 hour
}

fn default_provisioning_timeout() -> u64 {
    1800
}

fn default_infra_timeout() -> u64 {
    600
}

fn default_cleanup_timeout() -> u64 {
    900
}

fn default_cleanup_poll_interval() -> u64 {
    60
}

fn default_cleanup_job_interval() -> u64 {
    600
}

fn default_feature_download_dir() -> String {
    "/tmp".to_string()
}

fn default_scm_work_dir() -> String {
    "/tmp/gitspace-scm".to_string()
}

fn default_event_concurrency() -> usize {
    4
}

fn default_event_max_retries() -> u32 {
    2
}

fn default_event_idle_timeout() -> u64 {
    300
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from `GITSPACE_*` environment variables
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit variable map instead of the process environment
    pub fn load_from(vars: Option<HashMap<String, String>>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("GITSPACE")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn busy_action_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_action_timeout_secs)
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn infra_timeout(&self) -> Duration {
        Duration::from_secs(self.infra_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn cleanup_poll_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_poll_interval_secs)
    }

    pub fn cleanup_job_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_job_interval_secs)
    }

    pub fn event_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.event_idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            database_url: default_database_url(),
            docker_socket: None,
            default_base_image: default_base_image(),
            gitspace_host: default_gitspace_host(),
            proxy_host: None,
            busy_action_timeout_secs: default_busy_action_timeout(),
            provisioning_timeout_secs: default_provisioning_timeout(),
            infra_timeout_secs: default_infra_timeout(),
            cleanup_timeout_secs: default_cleanup_timeout(),
            cleanup_poll_interval_secs: default_cleanup_poll_interval(),
            cleanup_job_interval_secs: default_cleanup_job_interval(),
            feature_download_dir: default_feature_download_dir(),
            scm_work_dir: default_scm_work_dir(),
            event_concurrency: default_event_concurrency(),
            event_max_retries: default_event_max_retries(),
            event_idle_timeout_secs: default_event_idle_timeout(),
            log_format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_env_is_empty() {
        let config = Config::load_from(Some(HashMap::new())).expect("Failed to load config");
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.busy_action_timeout(), Duration::from_secs(3600));
        assert!(config.proxy_host.is_none());
        assert_eq!(
            config.default_base_image,
            "mcr.microsoft.com/devcontainers/base:dev-ubuntu-24.04"
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("GITSPACE_HTTP_PORT".to_string(), "8081".to_string()),
            ("GITSPACE_PROXY_HOST".to_string(), "proxy.local".to_string()),
            ("GITSPACE_EVENT_CONCURRENCY".to_string(), "8".to_string()),
        ]);
        let config = Config::load_from(Some(vars)).expect("Failed to load config");
        assert_eq!(config.http_port, 8081);
        assert_eq!(config.proxy_host.as_deref(), Some("proxy.local"));
        assert_eq!(config.event_concurrency, 8);
    }
}
