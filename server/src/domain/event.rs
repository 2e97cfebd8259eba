//! Gitspace lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::infra::Infrastructure;

macro_rules! gitspace_event_types {
    ($($variant:ident => $name:literal, $message:literal;)+) => {
        /// Every lifecycle boundary the orchestrator reports
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum GitspaceEventType {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl GitspaceEventType {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(GitspaceEventType::$variant => $name,)+
                }
            }

            pub fn from_str(s: &str) -> Option<Self> {
                match s {
                    $($name => Some(GitspaceEventType::$variant),)+
                    _ => None,
                }
            }

            /// Human readable message shown in the event timeline
            pub fn message(&self) -> &'static str {
                match self {
                    $(GitspaceEventType::$variant => $message,)+
                }
            }
        }
    };
}

gitspace_event_types! {
    GitspaceActionStart => "gitspace_action_start", "Setting up Gitspace...";
    GitspaceActionStartCompleted => "gitspace_action_start_completed", "Gitspace set up successfully";
    GitspaceActionStartFailed => "gitspace_action_start_failed", "Failed to set up Gitspace";

    GitspaceActionStop => "gitspace_action_stop", "Stopping Gitspace...";
    GitspaceActionStopCompleted => "gitspace_action_stop_completed", "Gitspace stopped successfully";
    GitspaceActionStopFailed => "gitspace_action_stop_failed", "Failed to stop Gitspace";

    GitspaceActionReset => "gitspace_action_reset", "Resetting Gitspace...";
    GitspaceActionResetCompleted => "gitspace_action_reset_completed", "Gitspace reset successfully";
    GitspaceActionResetFailed => "gitspace_action_reset_failed", "Failed to reset Gitspace";

    FetchDevcontainerStart => "fetch_devcontainer_start", "Fetching Devcontainer configuration...";
    FetchDevcontainerCompleted => "fetch_devcontainer_completed", "Devcontainer configuration fetched";
    FetchDevcontainerFailed => "fetch_devcontainer_failed", "Failed to fetch Devcontainer configuration";

    FetchConnectorsDetailsStart => "fetch_connectors_details_start", "Fetching platform connector details...";
    FetchConnectorsDetailsCompleted => "fetch_connectors_details_completed", "Platform connector details fetched";
    FetchConnectorsDetailsFailed => "fetch_connectors_details_failed", "Failed to fetch platform connector details";

    InfraProvisioningStart => "infra_provisioning_start", "Provisioning infrastructure...";
    InfraProvisioningCompleted => "infra_provisioning_completed", "Infrastructure provisioned successfully";
    InfraProvisioningFailed => "infra_provisioning_failed", "Failed to provision infrastructure";

    InfraStopStart => "infra_stop_start", "Stopping infrastructure...";
    InfraStopCompleted => "infra_stop_completed", "Infrastructure stopped successfully";
    InfraStopFailed => "infra_stop_failed", "Failed to stop infrastructure";

    InfraCleanupStart => "infra_cleanup_start", "Cleaning up infrastructure...";
    InfraCleanupCompleted => "infra_cleanup_completed", "Infrastructure cleaned up successfully";
    InfraCleanupFailed => "infra_cleanup_failed", "Failed to clean up infrastructure";

    InfraDeprovisioningStart => "infra_deprovisioning_start", "Deprovisioning infrastructure...";
    InfraDeprovisioningCompleted => "infra_deprovisioning_completed", "Infrastructure deprovisioned successfully";
    InfraDeprovisioningFailed => "infra_deprovisioning_failed", "Failed to deprovision infrastructure";

    AgentConnectStart => "agent_connect_start", "Connecting to Gitspace agent...";
    AgentConnectCompleted => "agent_connect_completed", "Connected to Gitspace agent";
    AgentConnectFailed => "agent_connect_failed", "Failed to connect to Gitspace agent";

    AgentGitspaceCreationStart => "agent_gitspace_creation_start", "Setting up Gitspace container...";
    AgentGitspaceCreationCompleted => "agent_gitspace_creation_completed", "Gitspace container set up successfully";
    AgentGitspaceCreationFailed => "agent_gitspace_creation_failed", "Failed to set up Gitspace";

    AgentGitspaceStopStart => "agent_gitspace_stop_start", "Stopping Gitspace container...";
    AgentGitspaceStopCompleted => "agent_gitspace_stop_completed", "Gitspace container stopped successfully";
    AgentGitspaceStopFailed => "agent_gitspace_stop_failed", "Failed to stop Gitspace container";

    AgentGitspaceDeletionStart => "agent_gitspace_deletion_start", "Removing Gitspace...";
    AgentGitspaceDeletionCompleted => "agent_gitspace_deletion_completed", "Gitspace removed successfully";
    AgentGitspaceDeletionFailed => "agent_gitspace_deletion_failed", "Failed to remove Gitspace";

    AgentGitspaceStateReportRunning => "agent_gitspace_state_report_running", "Gitspace is running";
    AgentGitspaceStateReportError => "agent_gitspace_state_report_error", "Gitspace encountered an error";
    AgentGitspaceStateReportStopped => "agent_gitspace_state_report_stopped", "Gitspace is stopped";
    AgentGitspaceStateReportUnknown => "agent_gitspace_state_report_unknown", "Gitspace state is unknown";

    GitspaceAutoStop => "gitspace_action_auto_stop", "Auto-stopping Gitspace due to inactivity...";
    GitspaceCleanupJob => "gitspace_action_cleanup_job", "Running Gitspace cleanup job...";

    InfraResetStart => "infra_reset_start", "Resetting infrastructure for Gitspace...";
    InfraResetFailed => "infra_reset_failed", "Failed to reset infrastructure for Gitspace";
}

impl std::fmt::Display for GitspaceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitspaceEntityType {
    GitspaceConfig,
    GitspaceInstance,
}

impl GitspaceEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitspaceEntityType::GitspaceConfig => "gitspace_config",
            GitspaceEntityType::GitspaceInstance => "gitspace_instance",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gitspace_config" => Some(GitspaceEntityType::GitspaceConfig),
            "gitspace_instance" => Some(GitspaceEntityType::GitspaceInstance),
            _ => None,
        }
    }
}

/// Payload emitted on the gitspace topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitspaceEventPayload {
    pub query_key: String,
    pub entity_id: i64,
    pub entity_type: GitspaceEntityType,
    pub event_type: GitspaceEventType,
    /// Unix timestamp in nanoseconds
    pub timestamp: i64,
}

/// A persisted gitspace event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitspaceEvent {
    pub id: i64,
    pub event: GitspaceEventType,
    pub message: String,
    pub entity_id: i64,
    pub query_key: String,
    pub entity_type: GitspaceEntityType,
    pub timestamp: i64,
    pub created_at: DateTime<Utc>,
}

/// Infra lifecycle notification that resumes an orchestrator operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraEventType {
    Provision,
    Stop,
    Deprovision,
    Cleanup,
}

impl InfraEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraEventType::Provision => "provision",
            InfraEventType::Stop => "stop",
            InfraEventType::Deprovision => "deprovision",
            InfraEventType::Cleanup => "cleanup",
        }
    }
}

/// Payload emitted on the infra topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitspaceInfraEventPayload {
    pub infra: Infrastructure,
    pub event_type: InfraEventType,
}

/// Kind of container operation that finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventType {
    Start,
    Stop,
    Delete,
}

impl OperationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationEventType::Start => "start",
            OperationEventType::Stop => "stop",
            OperationEventType::Delete => "delete",
        }
    }
}

/// Outcome reported by the container orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failure,
}

/// Payload emitted on the operations topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitspaceOperationsEventPayload {
    pub gitspace_config_identifier: String,
    pub gitspace_instance_identifier: String,
    pub event_type: OperationEventType,
    pub status: OperationStatus,
    pub error_message: Option<String>,
    pub response: Option<super::container::ContainerStartResponse>,
    /// Set on delete responses; false when the delete is a reset
    #[serde(default)]
    pub can_delete_user_data: bool,
    pub infra: Infrastructure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            GitspaceEventType::GitspaceAutoStop.as_str(),
            "gitspace_action_auto_stop"
        );
        assert_eq!(
            GitspaceEventType::from_str("infra_provisioning_failed"),
            Some(GitspaceEventType::InfraProvisioningFailed)
        );
        assert_eq!(GitspaceEventType::from_str("nope"), None);
    }

    #[test]
    fn test_event_messages() {
        assert_eq!(
            GitspaceEventType::GitspaceActionStart.message(),
            "Setting up Gitspace..."
        );
        assert_eq!(
            GitspaceEventType::InfraProvisioningStart.message(),
            "Provisioning infrastructure..."
        );
    }

    #[test]
    fn test_event_type_serde_matches_as_str() {
        let json = serde_json::to_string(&GitspaceEventType::AgentConnectFailed).unwrap();
        assert_eq!(json, "\"agent_connect_failed\"");
    }
}
