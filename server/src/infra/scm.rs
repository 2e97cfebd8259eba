//! Source control access: devcontainer.json lookup and clone details

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::devcontainer::DevcontainerConfig;
use crate::domain::gitspace::GitspaceConfig;
use crate::error::{Error, Result};

/// Default location of the devcontainer file inside a repository
pub const DEFAULT_DEVCONTAINER_PATH: &str = ".devcontainer/devcontainer.json";

/// Git identity and credentials used inside the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub email: String,
    pub name: String,
    pub user: String,
    pub password: String,
}

/// Everything needed to clone the repository of a gitspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDetails {
    pub clone_url: String,
    pub branch: String,
    pub repo_name: String,
    pub credentials: Option<ResolvedCredentials>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scm: Send + Sync {
    /// Fetch and parse the devcontainer file of the gitspace repository
    async fn devcontainer_config(&self, config: &GitspaceConfig) -> Result<DevcontainerConfig>;

    async fn repo_details(&self, config: &GitspaceConfig) -> Result<ResolvedDetails>;
}

/// Repository name from a clone URL: last path segment without `.git`
pub fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let segment = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    segment.trim_end_matches(".git").to_string()
}

/// SCM backed by the `git` binary, works with any reachable remote
pub struct GenericScm {
    work_dir: PathBuf,
}

impl GenericScm {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn credentials(config: &GitspaceConfig) -> Option<ResolvedCredentials> {
        config.code_repo_credentials.as_ref().map(|creds| ResolvedCredentials {
            email: format!("{}@gitspace.local", config.user_identifier),
            name: config.user_identifier.clone(),
            user: creds.username.clone(),
            password: creds.password.clone(),
        })
    }

    async fn shallow_clone(&self, config: &GitspaceConfig, target: &Path) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.env("GIT_TERMINAL_PROMPT", "0");

        if let Some(creds) = Self::credentials(config) {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.user, creds.password));
            cmd.arg("-c")
                .arg(format!("http.extraHeader=Authorization: Basic {}", token));
        }

        cmd.arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--branch")
            .arg(&config.branch)
            .arg(&config.code_repo_url)
            .arg(target);

        debug!(repo = %config.code_repo_url, branch = %config.branch, "Cloning repository");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::ScmError(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::ScmError(format!(
                "git clone of {} failed: {}",
                config.code_repo_url,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Scm for GenericScm {
    async fn devcontainer_config(&self, config: &GitspaceConfig) -> Result<DevcontainerConfig> {
        let checkout = self
            .work_dir
            .join(format!("gitspace-scm-{}", Uuid::new_v4().simple()));

        let result = async {
            self.shallow_clone(config, &checkout).await?;

            let relative = config
                .devcontainer_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_DEVCONTAINER_PATH);
            let path = checkout.join(relative.trim_start_matches('/'));

            match tokio::fs::read_to_string(&path).await {
                Ok(content) => DevcontainerConfig::from_jsonc(&content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %relative, "No devcontainer file, using defaults");
                    Ok(DevcontainerConfig::default())
                }
                Err(e) => Err(Error::ScmError(format!("failed to read {}: {}", relative, e))),
            }
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&checkout).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %checkout.display(), "Failed to remove checkout: {}", e);
            }
        }

        result
    }

    async fn repo_details(&self, config: &GitspaceConfig) -> Result<ResolvedDetails> {
        Ok(ResolvedDetails {
            clone_url: config.code_repo_url.clone(),
            branch: config.branch.clone(),
            repo_name: repo_name_from_url(&config.code_repo_url),
            credentials: Self::credentials(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::gitspace::CodeRepoCredentials;
    use crate::domain::ide::IdeType;

    fn config(url: &str) -> GitspaceConfig {
        GitspaceConfig {
            id: 1,
            identifier: "app".to_string(),
            name: "app".to_string(),
            space_path: "acme".to_string(),
            user_identifier: "alice".to_string(),
            code_repo_url: url.to_string(),
            branch: "main".to_string(),
            devcontainer_path: None,
            ide: IdeType::VsCodeWeb,
            infra_provider_resource: "default".to_string(),
            ssh_token_identifier: None,
            code_repo_credentials: None,
            is_marked_for_reset: false,
            is_deleted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            instance: None,
        }
    }

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(repo_name_from_url("https://github.com/acme/app.git"), "app");
        assert_eq!(repo_name_from_url("https://github.com/acme/app/"), "app");
        assert_eq!(repo_name_from_url("git@github.com:acme/tools.git"), "tools");
        assert_eq!(repo_name_from_url("git@host:repo.git"), "repo");
    }

    #[tokio::test]
    async fn test_repo_details_with_credentials() {
        let scm = GenericScm::new(std::env::temp_dir());
        let mut cfg = config("https://github.com/acme/app.git");
        assert!(scm.repo_details(&cfg).await.unwrap().credentials.is_none());

        cfg.code_repo_credentials = Some(CodeRepoCredentials {
            username: "bot".to_string(),
            password: "token".to_string(),
        });
        let details = scm.repo_details(&cfg).await.unwrap();
        assert_eq!(details.repo_name, "app");
        assert_eq!(details.branch, "main");
        let creds = details.credentials.unwrap();
        assert_eq!(creds.user, "bot");
        assert_eq!(creds.name, "alice");
    }

    #[tokio::test]
    async fn test_clone_failure_is_scm_error() {
        let dir = tempfile::tempdir().unwrap();
        let scm = GenericScm::new(dir.path());
        let cfg = config(&format!("file://{}/does-not-exist", dir.path().display()));
        let err = scm.devcontainer_config(&cfg).await.unwrap_err();
        assert!(matches!(err, Error::ScmError(_)));
    }
}
