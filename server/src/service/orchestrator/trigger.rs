use tracing::{info, warn};

use super::{failure, instance_identifier, GitspaceOrchestrator, GitspaceResult};
use crate::domain::event::GitspaceEventType;
use crate::domain::gitspace::{GitspaceConfig, GitspaceInstanceState};
use crate::domain::infra::{InfraStatus, Infrastructure};
use crate::error::{Error, GitspaceError, Result};

impl GitspaceOrchestrator {
    pub(super) async fn trigger_start(&self, config: &GitspaceConfig) -> GitspaceResult<()> {
        self.emit(config, GitspaceEventType::FetchDevcontainerStart).await;
        let devcontainer = match self.scm.devcontainer_config(config).await {
            Ok(devcontainer) => devcontainer,
            Err(err) => {
                self.emit(config, GitspaceEventType::FetchDevcontainerFailed).await;
                return Err(failure(
                    err,
                    format!("failed to fetch devcontainer config for gitspace config {}", config.id),
                ));
            }
        };
        self.emit(config, GitspaceEventType::FetchDevcontainerCompleted).await;

        let ports = self
            .required_ports(config, &devcontainer)
            .map_err(|e| failure(e, "cannot get the ports required for gitspace during start"))?;

        self.emit(config, GitspaceEventType::InfraProvisioningStart).await;
        if let Err(err) = self.provisioner.trigger_provision(config, &ports).await {
            self.emit(config, GitspaceEventType::InfraProvisioningFailed).await;
            return Err(failure(
                err,
                format!(
                    "cannot trigger provision infrastructure for ID {}",
                    config.infra_provider_resource
                ),
            ));
        }
        Ok(())
    }

    pub(super) async fn trigger_stop(&self, config: &GitspaceConfig) -> GitspaceResult<()> {
        let infra = self
            .provisioned_infra(config, &[InfraStatus::Provisioned, InfraStatus::Stopped])
            .await
            .map_err(|e| {
                failure(
                    e,
                    format!(
                        "unable to find provisioned infra while triggering stop for gitspace instance {}",
                        instance_identifier(config)
                    ),
                )
            })?;

        let state = config.instance()?.state;
        if matches!(
            state,
            GitspaceInstanceState::Running | GitspaceInstanceState::Stopping
        ) {
            self.stop_container(config, &infra)
                .await
                .map_err(GitspaceError::new)?;
        }
        Ok(())
    }

    pub(crate) async fn connect(&self, config: &GitspaceConfig, infra: &Infrastructure) -> Result<()> {
        self.emit(config, GitspaceEventType::AgentConnectStart).await;
        if let Err(err) = self.containers.status(infra).await {
            self.emit(config, GitspaceEventType::AgentConnectFailed).await;
            return Err(Error::InfraUnreachable(err.to_string())
                .context("couldn't reach the container engine"));
        }
        self.emit(config, GitspaceEventType::AgentConnectCompleted).await;
        Ok(())
    }

    async fn stop_container(&self, config: &GitspaceConfig, infra: &Infrastructure) -> Result<()> {
        self.connect(config, infra).await?;

        self.emit(config, GitspaceEventType::AgentGitspaceStopStart).await;
        if let Err(err) = self.containers.stop_gitspace(config, infra).await {
            self.emit(config, GitspaceEventType::AgentGitspaceStopFailed).await;
            return Err(err.context("error stopping the gitspace container"));
        }
        Ok(())
    }

    async fn stop_and_remove_container(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        can_delete_user_data: bool,
    ) -> Result<()> {
        self.connect(config, infra).await?;

        self.emit(config, GitspaceEventType::AgentGitspaceDeletionStart).await;
        if let Err(err) = self
            .containers
            .stop_and_remove_gitspace(config, infra, can_delete_user_data)
            .await
        {
            self.emit(config, GitspaceEventType::AgentGitspaceDeletionFailed).await;
            return Err(err.context("error removing the gitspace container"));
        }
        Ok(())
    }

    pub(super) async fn trigger_stop_and_delete(
        &self,
        config: &GitspaceConfig,
        can_delete_user_data: bool,
    ) -> Result<()> {
        let infra = self
            .provisioned_infra(
                config,
                &[
                    InfraStatus::Pending,
                    InfraStatus::Provisioned,
                    InfraStatus::Stopped,
                    InfraStatus::Destroyed,
                    InfraStatus::Error,
                    InfraStatus::Unknown,
                ],
            )
            .await
            .map_err(|e| {
                e.context(format!(
                    "unable to find provisioned infra while triggering delete for gitspace instance {}",
                    instance_identifier(config)
                ))
            })?;

        if let Err(err) = self
            .stop_and_remove_container(config, &infra, can_delete_user_data)
            .await
        {
            // Release the infra even when the container could not be removed
            warn!(gitspace = %config.identifier, "Error stopping and removing gitspace container: {}", err);
            return self.force_deprovision(config, &infra, can_delete_user_data).await;
        }

        info!(
            gitspace = %config.identifier,
            "Waiting for instance {} to be cleaned up", instance_identifier(config)
        );
        if let Err(err) = self.wait_for_cleanup(config).await {
            warn!(gitspace = %config.identifier, "Forcing deprovision: {}", err);
            return self.force_deprovision(config, &infra, can_delete_user_data).await;
        }
        Ok(())
    }

    async fn force_deprovision(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        can_delete_user_data: bool,
    ) -> Result<()> {
        if let Err(err) = self
            .provisioner
            .trigger_deprovision(config, infra, can_delete_user_data)
            .await
        {
            let failed = if can_delete_user_data {
                GitspaceEventType::InfraDeprovisioningFailed
            } else {
                GitspaceEventType::InfraResetFailed
            };
            self.emit(config, failed).await;
            return Err(err.context(format!(
                "cannot trigger deprovision infrastructure for gitspace instance {}",
                instance_identifier(config)
            )));
        }
        Ok(())
    }

    /// Poll the instance until it is deleted or cleaned, bounded by the cleanup timeout
    async fn wait_for_cleanup(&self, config: &GitspaceConfig) -> Result<()> {
        let instance = config.instance()?;
        let poll = async {
            let mut ticker = tokio::time::interval(self.settings.cleanup_poll_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = self.instances.find(instance.id).await.map_err(|e| {
                    e.context(format!("failed to find gitspace instance {}", instance.identifier))
                })?;
                if matches!(
                    current.state,
                    GitspaceInstanceState::Deleted | GitspaceInstanceState::Cleaned
                ) {
                    return Ok::<(), Error>(());
                }
            }
        };

        tokio::time::timeout(self.settings.cleanup_timeout, poll)
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "timeout waiting for gitspace cleanup for instance {}",
                    instance.identifier
                ))
            })?
    }

    pub(super) async fn trigger_cleanup(&self, config: &GitspaceConfig) -> Result<()> {
        let infra = self
            .provisioned_infra(
                config,
                &[
                    InfraStatus::Provisioned,
                    InfraStatus::Stopped,
                    InfraStatus::Pending,
                    InfraStatus::Unknown,
                    InfraStatus::Destroyed,
                ],
            )
            .await
            .map_err(|e| {
                e.context(format!(
                    "unable to find provisioned infra while triggering cleanup for gitspace instance {}",
                    instance_identifier(config)
                ))
            })?;

        let state = config.instance()?.state;
        if state != GitspaceInstanceState::Cleaning {
            return Err(Error::InvalidInstanceState {
                expected: GitspaceInstanceState::Cleaning.to_string(),
                actual: state.to_string(),
            }
            .context("cannot trigger cleanup"));
        }

        self.emit(config, GitspaceEventType::InfraCleanupStart).await;
        self.provisioner
            .trigger_cleanup_instance(config, &infra)
            .await
            .map_err(|e| {
                e.context(format!(
                    "cannot trigger cleanup infrastructure with ID {}",
                    config.infra_provider_resource
                ))
            })
    }
}
