use chrono::Utc;
use tracing::{debug, warn};

use super::{failure, ide_url, instance_identifier, GitspaceOrchestrator, GitspaceResult};
use crate::domain::event::{
    GitspaceEventType, GitspaceOperationsEventPayload, InfraEventType, OperationStatus,
};
use crate::domain::gitspace::{
    GitspaceAccessType, GitspaceConfig, GitspaceInstance, GitspaceInstanceState,
};
use crate::domain::infra::{format_statuses, InfraStatus, Infrastructure};
use crate::error::{Error, GitspaceError, Result};
use crate::service::container::StartRequest;

/// Error unless `infra` is in one of `expected`
fn require_status(
    config: &GitspaceConfig,
    infra: &Infrastructure,
    expected: &[InfraStatus],
) -> Result<()> {
    if expected.contains(&infra.status) {
        return Ok(());
    }
    Err(Error::UnexpectedInfraStatus {
        expected: format_statuses(expected),
        actual: infra.status.to_string(),
    }
    .context(format!(
        "unexpected infra state for gitspace instance {}",
        instance_identifier(config)
    )))
}

/// Error carried by a failed container operation
fn operation_failure(outcome: &GitspaceOperationsEventPayload) -> Option<GitspaceError> {
    if outcome.status == OperationStatus::Success {
        return None;
    }
    let message = outcome
        .error_message
        .clone()
        .unwrap_or_else(|| "gitspace agent does not specify the error for failure".to_string());
    Some(GitspaceError::with_message(
        Error::ProvisioningError(message.clone()),
        message,
    ))
}

impl GitspaceOrchestrator {
    /// Secret the remote user authenticates with
    async fn resolve_access_key(&self, config: &GitspaceConfig) -> Result<String> {
        let instance = config.instance()?;
        let reference = match instance.access_type {
            GitspaceAccessType::UserCredentials => instance.access_key_ref.clone(),
            GitspaceAccessType::SshKey => config.ssh_token_identifier.clone(),
            GitspaceAccessType::JwtToken => {
                return Err(Error::SecretError(format!(
                    "no secret resolver for access type {}",
                    instance.access_type.as_str()
                )));
            }
        };
        let reference = reference.ok_or_else(|| {
            Error::SecretError(format!(
                "gitspace instance {} has no access key reference",
                instance.identifier
            ))
        })?;

        self.secrets.get(&reference).await.map_err(|e| {
            e.context(format!(
                "could not resolve secret type: {}, ref: {}",
                instance.access_type.as_str(),
                reference
            ))
        })
    }

    pub(super) async fn resume_start(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> GitspaceResult<()> {
        let access_key = self
            .resolve_access_key(config)
            .await
            .map_err(|e| failure(e, "cannot resolve the gitspace access key"))?;

        let ide = self
            .ides
            .get(config.ide)
            .map_err(|e| failure(e, "cannot find the IDE service"))?;

        if let Err(err) = self
            .provisioner
            .post_infra_event_complete(config, infra, InfraEventType::Provision)
            .await
        {
            self.emit(config, GitspaceEventType::InfraProvisioningFailed).await;
            return Err(failure(
                err,
                format!(
                    "cannot provision infrastructure for ID {}",
                    config.infra_provider_resource
                ),
            ));
        }

        if let Err(err) = require_status(config, infra, &[InfraStatus::Provisioned]) {
            self.emit(config, GitspaceEventType::InfraProvisioningFailed).await;
            return Err(GitspaceError::new(err));
        }
        self.emit(config, GitspaceEventType::InfraProvisioningCompleted).await;

        self.emit(config, GitspaceEventType::FetchDevcontainerStart).await;
        let fetched = async {
            let devcontainer = self.scm.devcontainer_config(config).await?;
            let repo = self.scm.repo_details(config).await?;
            Ok::<_, Error>((devcontainer, repo))
        }
        .await;
        let (devcontainer, repo) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                self.emit(config, GitspaceEventType::FetchDevcontainerFailed).await;
                return Err(failure(
                    err,
                    format!("failed to fetch code repo details for gitspace config ID {}", config.id),
                ));
            }
        };
        self.emit(config, GitspaceEventType::FetchDevcontainerCompleted).await;

        self.connect(config, infra).await.map_err(GitspaceError::new)?;

        let refs = devcontainer.connector_refs();
        let connectors = if refs.is_empty() {
            Vec::new()
        } else {
            self.emit(config, GitspaceEventType::FetchConnectorsDetailsStart).await;
            match self.connectors.fetch_connectors(&config.space_path, &refs).await {
                Ok(connectors) => {
                    self.emit(config, GitspaceEventType::FetchConnectorsDetailsCompleted).await;
                    connectors
                }
                Err(err) => {
                    self.emit(config, GitspaceEventType::FetchConnectorsDetailsFailed).await;
                    let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
                    return Err(failure(
                        err,
                        format!("failed to fetch connectors for gitspace: [{}]", ids.join(" ")),
                    ));
                }
            }
        };

        self.emit(config, GitspaceEventType::AgentGitspaceCreationStart).await;
        let request = StartRequest {
            config: config.clone(),
            infra: infra.clone(),
            repo,
            devcontainer,
            default_base_image: self.settings.default_base_image.clone(),
            ide,
            connectors,
            access_key,
        };
        if let Err(err) = self.containers.create_and_start_gitspace(request).await {
            self.emit(config, GitspaceEventType::AgentGitspaceCreationFailed).await;
            return Err(failure(err, "couldn't call the agent start API"));
        }
        Ok(())
    }

    pub(super) async fn finish_resume_start(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<GitspaceInstance> {
        let response = match (operation_failure(outcome), outcome.response.as_ref()) {
            (None, Some(response)) => response,
            (Some(err), _) => {
                self.emit(config, GitspaceEventType::AgentGitspaceCreationFailed).await;
                return Err(err);
            }
            (None, None) => {
                self.emit(config, GitspaceEventType::AgentGitspaceCreationFailed).await;
                let message = "gitspace agent does not specify the start response".to_string();
                return Err(GitspaceError::with_message(
                    Error::ProvisioningError(message.clone()),
                    message,
                ));
            }
        };

        let ide = self.ides.get(config.ide).map_err(GitspaceError::new)?;
        let mut instance = config.instance().map_err(GitspaceError::new)?.clone();
        // A start that already failed or timed out cannot come back to life
        instance
            .transition_to(GitspaceInstanceState::Running)
            .map_err(|e| failure(e, "stale gitspace start response"))?;

        let now = Utc::now();
        instance.url = Some(ide_url(ide.as_ref(), infra, response));
        instance.last_used = Some(now);
        instance.active_time_started = Some(now);
        instance.last_heartbeat = Some(now);
        instance.error_message = None;
        debug!(
            gitspace = %config.identifier,
            "Gitspace instance {} is reachable at {}",
            instance.identifier,
            instance.url.as_deref().unwrap_or_default()
        );

        self.emit(config, GitspaceEventType::AgentGitspaceCreationCompleted).await;
        self.emit(config, GitspaceEventType::GitspaceActionStartCompleted).await;
        Ok(instance)
    }

    pub(super) async fn finish_stop(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<()> {
        if let Some(err) = operation_failure(outcome) {
            self.emit(config, GitspaceEventType::AgentGitspaceStopFailed).await;
            return Err(err);
        }
        self.emit(config, GitspaceEventType::AgentGitspaceStopCompleted).await;

        self.emit(config, GitspaceEventType::InfraStopStart).await;
        if let Err(err) = self.provisioner.trigger_stop(config, infra).await {
            self.emit(config, GitspaceEventType::InfraStopFailed).await;
            return Err(failure(
                err,
                format!(
                    "cannot trigger stop infrastructure with ID {}",
                    config.infra_provider_resource
                ),
            ));
        }
        Ok(())
    }

    pub(super) async fn finish_stop_and_remove(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<()> {
        if let Some(err) = operation_failure(outcome) {
            self.emit(config, GitspaceEventType::AgentGitspaceDeletionFailed).await;
            return Err(err);
        }
        self.emit(config, GitspaceEventType::AgentGitspaceDeletionCompleted).await;

        let (start, failed) = if outcome.can_delete_user_data {
            (
                GitspaceEventType::InfraDeprovisioningStart,
                GitspaceEventType::InfraDeprovisioningFailed,
            )
        } else {
            (
                GitspaceEventType::InfraResetStart,
                GitspaceEventType::InfraResetFailed,
            )
        };
        self.emit(config, start).await;
        if let Err(err) = self
            .provisioner
            .trigger_deprovision(config, infra, outcome.can_delete_user_data)
            .await
        {
            self.emit(config, failed).await;
            return Err(failure(
                err,
                format!(
                    "cannot trigger deprovision infrastructure with ID {}",
                    config.infra_provider_resource
                ),
            ));
        }
        Ok(())
    }

    pub(super) async fn resume_stop(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> GitspaceResult<GitspaceInstanceState> {
        if let Err(err) = self
            .provisioner
            .post_infra_event_complete(config, infra, InfraEventType::Stop)
            .await
        {
            self.emit(config, GitspaceEventType::InfraStopFailed).await;
            return Err(failure(
                err,
                format!(
                    "cannot stop provisioned infrastructure with ID {}",
                    config.infra_provider_resource
                ),
            ));
        }

        if let Err(err) = require_status(
            config,
            infra,
            &[InfraStatus::Stopped, InfraStatus::Destroyed],
        ) {
            self.emit(config, GitspaceEventType::InfraStopFailed).await;
            return Err(GitspaceError::new(err));
        }

        self.emit(config, GitspaceEventType::InfraStopCompleted).await;
        self.emit(config, GitspaceEventType::GitspaceActionStopCompleted).await;
        Ok(GitspaceInstanceState::Stopped)
    }

    pub(super) async fn resume_delete(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<GitspaceInstanceState> {
        if let Err(err) = self
            .provisioner
            .post_infra_event_complete(config, infra, InfraEventType::Deprovision)
            .await
        {
            self.emit(config, GitspaceEventType::InfraDeprovisioningFailed).await;
            return Err(err.context(format!(
                "cannot deprovision infrastructure with ID {}",
                config.infra_provider_resource
            )));
        }

        if let Err(err) = require_status(config, infra, &[InfraStatus::Destroyed]) {
            self.emit(config, GitspaceEventType::InfraDeprovisioningFailed).await;
            return Err(err);
        }

        self.emit(config, GitspaceEventType::InfraDeprovisioningCompleted).await;
        Ok(GitspaceInstanceState::Deleted)
    }

    pub(super) async fn resume_cleanup(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<GitspaceInstanceState> {
        if let Err(err) = self
            .provisioner
            .post_infra_event_complete(config, infra, InfraEventType::Cleanup)
            .await
        {
            self.emit(config, GitspaceEventType::InfraCleanupFailed).await;
            return Err(err.context(format!(
                "cannot cleanup provisioned infrastructure with ID {}",
                config.infra_provider_resource
            )));
        }

        if let Err(err) = require_status(
            config,
            infra,
            &[InfraStatus::Destroyed, InfraStatus::Stopped],
        ) {
            warn!(gitspace = %config.identifier, "Cleanup finished in an unexpected state: {}", err);
            self.emit(config, GitspaceEventType::InfraCleanupFailed).await;
            return Err(err);
        }

        self.emit(config, GitspaceEventType::InfraCleanupCompleted).await;
        Ok(GitspaceInstanceState::Cleaned)
    }
}
