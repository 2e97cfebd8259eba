//! Container level types shared by the orchestrators

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::devcontainer::LifecycleCommand;

/// Label holding the remote user of a gitspace container
pub const REMOTE_USER_LABEL: &str = "gitspace.remote.user";

/// Label holding the merged lifecycle hooks of a gitspace container
pub const LIFECYCLE_HOOKS_LABEL: &str = "gitspace.lifecycle.hooks";

/// Container state as seen through the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Stopped,
    Removed,
    Created,
    Paused,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Removed => "removed",
            ContainerState::Created => "created",
            ContainerState::Paused => "paused",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        }
    }

    /// Map a raw engine state string
    pub fn from_engine(raw: &str) -> Self {
        match raw {
            "running" => ContainerState::Running,
            "exited" => ContainerState::Stopped,
            "dead" => ContainerState::Dead,
            "created" => ContainerState::Created,
            "paused" => ContainerState::Paused,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a container returned by a name-filtered list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Names as reported by the engine, with a leading slash
    pub names: Vec<String>,
    pub state: String,
}

/// Lifecycle phase a hook runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostAction {
    PostCreate,
    PostStart,
}

impl PostAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostAction::PostCreate => "postCreateCommand",
            PostAction::PostStart => "postStartCommand",
        }
    }
}

impl std::fmt::Display for PostAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle command with its origin and failure policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleHookStep {
    pub source: String,
    pub command: LifecycleCommand,
    pub action_type: PostAction,
    pub stop_on_failure: bool,
}

/// Hooks grouped by phase
pub type LifecycleHooks = HashMap<PostAction, Vec<LifecycleHookStep>>;

/// Result of a successful container start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStartResponse {
    pub container_id: String,
    pub container_name: String,
    /// Container port to published host port
    pub published_ports: HashMap<u16, String>,
    pub absolute_repo_path: String,
    pub remote_user: String,
}

/// Output of a command executed inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// What the engine knows about an image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageData {
    /// Image user, `root` when unset
    pub user: String,
    /// Merged `devcontainer.metadata` label entries
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub os: String,
    pub arch: String,
}

/// Host directory for a user inside the container
pub fn user_home_dir(user: &str) -> String {
    if user == "root" || user.is_empty() {
        "/root".to_string()
    } else {
        format!("/home/{}", user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_mapping() {
        assert_eq!(ContainerState::from_engine("running"), ContainerState::Running);
        assert_eq!(ContainerState::from_engine("exited"), ContainerState::Stopped);
        assert_eq!(ContainerState::from_engine("dead"), ContainerState::Dead);
        assert_eq!(ContainerState::from_engine("created"), ContainerState::Created);
        assert_eq!(ContainerState::from_engine("paused"), ContainerState::Paused);
        assert_eq!(ContainerState::from_engine("restarting"), ContainerState::Unknown);
        assert_eq!(ContainerState::from_engine(""), ContainerState::Unknown);
    }

    #[test]
    fn test_user_home_dir() {
        assert_eq!(user_home_dir("root"), "/root");
        assert_eq!(user_home_dir("vscode"), "/home/vscode");
    }

    #[test]
    fn test_hook_label_round_trip() {
        let hooks: LifecycleHooks = HashMap::from([(
            PostAction::PostStart,
            vec![LifecycleHookStep {
                source: "devcontainer.json".to_string(),
                command: LifecycleCommand::Command("npm start".to_string()),
                action_type: PostAction::PostStart,
                stop_on_failure: false,
            }],
        )]);
        let encoded = serde_json::to_string(&hooks).unwrap();
        let decoded: LifecycleHooks = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, hooks);
    }
}
