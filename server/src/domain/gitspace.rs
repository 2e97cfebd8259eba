//! Gitspace config and instance domain model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ide::IdeType;
use crate::error::{Error, Result};

/// Identifier used as the in-container user for every gitspace
pub const GITSPACE_USER: &str = "gitspace";

/// Gitspace instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitspaceInstanceState {
    /// Instance record exists but nothing was dispatched yet
    Uninitialized,
    /// Infra provisioning and container setup in progress
    Starting,
    /// Container is up and the IDE is reachable
    Running,
    /// Container and infra are being stopped
    Stopping,
    /// Container is stopped, user data kept
    Stopped,
    /// A lifecycle operation failed
    Error,
    /// Instance resources are being cleaned up
    Cleaning,
    /// Instance resources were cleaned up
    Cleaned,
    /// Container and infra were removed
    Deleted,
}

impl GitspaceInstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitspaceInstanceState::Uninitialized => "uninitialized",
            GitspaceInstanceState::Starting => "starting",
            GitspaceInstanceState::Running => "running",
            GitspaceInstanceState::Stopping => "stopping",
            GitspaceInstanceState::Stopped => "stopped",
            GitspaceInstanceState::Error => "error",
            GitspaceInstanceState::Cleaning => "cleaning",
            GitspaceInstanceState::Cleaned => "cleaned",
            GitspaceInstanceState::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uninitialized" => Some(GitspaceInstanceState::Uninitialized),
            "starting" => Some(GitspaceInstanceState::Starting),
            "running" => Some(GitspaceInstanceState::Running),
            "stopping" => Some(GitspaceInstanceState::Stopping),
            "stopped" => Some(GitspaceInstanceState::Stopped),
            "error" => Some(GitspaceInstanceState::Error),
            "cleaning" => Some(GitspaceInstanceState::Cleaning),
            "cleaned" => Some(GitspaceInstanceState::Cleaned),
            "deleted" => Some(GitspaceInstanceState::Deleted),
            _ => None,
        }
    }

    /// States in which an operation is in flight and new actions are rejected
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            GitspaceInstanceState::Starting
                | GitspaceInstanceState::Stopping
                | GitspaceInstanceState::Cleaning
        )
    }

    /// States after which a new instance must be created to start again
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            GitspaceInstanceState::Stopped
                | GitspaceInstanceState::Error
                | GitspaceInstanceState::Cleaned
                | GitspaceInstanceState::Deleted
        )
    }

    /// Check whether a transition to `next` is legal
    ///
    /// Besides the lifecycle path, a failed instance may move to `cleaning`
    /// so that reset and delete can release whatever it had provisioned.
    pub fn can_transition_to(&self, next: GitspaceInstanceState) -> bool {
        use GitspaceInstanceState::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            // Deleted is absorbing
            (Deleted, _) => false,
            (_, Error) | (_, Deleted) => true,
            (Uninitialized, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) | (Running, Cleaning) => true,
            (Stopping, Stopped) => true,
            (Stopped, Cleaning) => true,
            (Error, Cleaning) => true,
            (Cleaning, Cleaned) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for GitspaceInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the user authenticates against the running gitspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitspaceAccessType {
    UserCredentials,
    JwtToken,
    SshKey,
}

impl GitspaceAccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitspaceAccessType::UserCredentials => "user_credentials",
            GitspaceAccessType::JwtToken => "jwt_token",
            GitspaceAccessType::SshKey => "ssh_key",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user_credentials" => Some(GitspaceAccessType::UserCredentials),
            "jwt_token" => Some(GitspaceAccessType::JwtToken),
            "ssh_key" => Some(GitspaceAccessType::SshKey),
            _ => None,
        }
    }
}

/// User-facing action on a gitspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitspaceActionType {
    Start,
    Stop,
    Reset,
}

impl GitspaceActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitspaceActionType::Start => "start",
            GitspaceActionType::Stop => "stop",
            GitspaceActionType::Reset => "reset",
        }
    }
}

/// Optional username/password used to clone private repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRepoCredentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

/// Durable definition of a gitspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitspaceConfig {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    /// Path of the owning space
    pub space_path: String,
    /// Identifier of the user owning the gitspace
    pub user_identifier: String,
    pub code_repo_url: String,
    pub branch: String,
    /// Path of the devcontainer file inside the repository
    pub devcontainer_path: Option<String>,
    pub ide: IdeType,
    /// Key of the infra provider resource this gitspace runs on
    pub infra_provider_resource: String,
    /// Reference to the SSH public key used for ssh_key access
    pub ssh_token_identifier: Option<String>,
    pub code_repo_credentials: Option<CodeRepoCredentials>,
    pub is_marked_for_reset: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Latest instance, when loaded together with the config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<GitspaceInstance>,
}

impl GitspaceConfig {
    /// Latest instance or an error when none was loaded
    pub fn instance(&self) -> Result<&GitspaceInstance> {
        self.instance
            .as_ref()
            .ok_or_else(|| Error::InstanceNotFound(self.identifier.clone()))
    }

    pub fn instance_mut(&mut self) -> Result<&mut GitspaceInstance> {
        let identifier = self.identifier.clone();
        self.instance
            .as_mut()
            .ok_or(Error::InstanceNotFound(identifier))
    }

    /// Access type implied by the config
    pub fn access_type(&self) -> GitspaceAccessType {
        if self.ssh_token_identifier.is_some() {
            GitspaceAccessType::SshKey
        } else {
            GitspaceAccessType::UserCredentials
        }
    }
}

/// Parameters for creating a gitspace config
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGitspaceParams {
    pub identifier: String,
    pub name: Option<String>,
    pub space_path: Option<String>,
    pub user_identifier: Option<String>,
    pub code_repo_url: String,
    pub branch: Option<String>,
    pub devcontainer_path: Option<String>,
    pub ide: IdeType,
    pub infra_provider_resource: Option<String>,
    pub ssh_token_identifier: Option<String>,
    pub code_repo_credentials: Option<CodeRepoCredentials>,
}

/// One provisioning attempt of a gitspace config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitspaceInstance {
    pub id: i64,
    pub gitspace_config_id: i64,
    pub identifier: String,
    pub state: GitspaceInstanceState,
    pub url: Option<String>,
    pub access_type: GitspaceAccessType,
    /// Reference of the secret holding the access key
    pub access_key_ref: Option<String>,
    /// Resolved access key; never persisted
    #[serde(skip)]
    pub access_key: Option<String>,
    pub machine_user: Option<String>,
    pub space_path: String,
    pub user_identifier: String,
    pub last_used: Option<DateTime<Utc>>,
    /// Accumulated active time in milliseconds
    pub total_time_used: i64,
    pub active_time_started: Option<DateTime<Utc>>,
    pub active_time_ended: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub has_git_changes: Option<bool>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GitspaceInstance {
    /// Build a fresh, not yet persisted instance for a config
    pub fn new_for(config: &GitspaceConfig) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: 0,
            gitspace_config_id: config.id,
            identifier: format!("{}-{}", config.identifier, &suffix[..8]).to_lowercase(),
            state: GitspaceInstanceState::Uninitialized,
            url: None,
            access_type: config.access_type(),
            access_key_ref: None,
            access_key: None,
            machine_user: None,
            space_path: config.space_path.clone(),
            user_identifier: config.user_identifier.clone(),
            last_used: None,
            total_time_used: 0,
            active_time_started: None,
            active_time_ended: None,
            last_heartbeat: None,
            has_git_changes: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition_to(&mut self, next: GitspaceInstanceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidInstanceTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Close the current active window and add it to the total
    pub fn accrue_active_time(&mut self, now: DateTime<Utc>) {
        self.active_time_ended = Some(now);
        if let Some(started) = self.active_time_started {
            let elapsed = (now - started).num_milliseconds().max(0);
            self.total_time_used += elapsed;
        }
    }

    /// Whether a busy instance is still inside its busy window
    pub fn is_busy_within(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        if !self.state.is_busy() {
            return false;
        }
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now - self.updated_at < timeout
    }
}
