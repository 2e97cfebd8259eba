//! Gitspace lifecycle coordination
//!
//! Every intent is split in three: a trigger that starts the work and returns,
//! a resume that runs when the infra event for that work arrives, and a finish
//! that interprets the container operation outcome. Only resume and finish
//! decide the final instance state; the event handlers persist it.

mod resume;
mod trigger;
mod url;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

pub use self::url::ide_url;
use crate::domain::devcontainer::DevcontainerConfig;
use crate::domain::event::{GitspaceEventType, GitspaceOperationsEventPayload};
use crate::domain::gitspace::{GitspaceConfig, GitspaceInstance, GitspaceInstanceState};
use crate::domain::ide::{GitspacePort, PortProtocol};
use crate::domain::infra::{format_statuses, InfraStatus, Infrastructure};
use crate::error::{Error, GitspaceError, Result};
use crate::infra::connector::PlatformConnector;
use crate::infra::event_bus::{gitspace_event, EventReporter};
use crate::infra::provisioner::InfraProvisioner;
use crate::infra::scm::Scm;
use crate::infra::secret::SecretStore;
use crate::infra::sqlite::GitspaceInstanceStore;
use crate::service::container::ContainerOrchestrator;
use crate::service::ide::IdeFactory;

/// Outcome of a trigger, resume or finish step
pub type GitspaceResult<T> = std::result::Result<T, GitspaceError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Fetch the devcontainer config and trigger infra provisioning
    async fn trigger_start_gitspace(&self, config: &GitspaceConfig) -> GitspaceResult<()>;

    /// Stop the container; the infra stop follows once the container reports back
    async fn trigger_stop_gitspace(&self, config: &GitspaceConfig) -> GitspaceResult<()>;

    /// Remove the container and deprovision the infra, waiting for the cleanup
    async fn trigger_stop_and_delete_gitspace(
        &self,
        config: &GitspaceConfig,
        can_delete_user_data: bool,
    ) -> Result<()>;

    /// Release resources exclusive to a `cleaning` instance
    async fn trigger_cleanup_instance_resources(&self, config: &GitspaceConfig) -> Result<()>;

    /// Continue a start once its infra is provisioned
    async fn resume_start_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> GitspaceResult<()>;

    /// Turn a container start outcome into a running instance with its IDE URL
    async fn finish_resume_start_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<GitspaceInstance>;

    /// Trigger the infra stop once the container stopped
    async fn finish_stop_gitspace_container(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<()>;

    /// Trigger the deprovision once the container was removed
    async fn finish_stop_and_remove_gitspace_container(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<()>;

    async fn resume_stop_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> GitspaceResult<GitspaceInstanceState>;

    async fn resume_delete_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<GitspaceInstanceState>;

    async fn resume_cleanup_instance_resources(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<GitspaceInstanceState>;
}

/// Timing and defaults of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_base_image: String,
    /// Upper bound of the wait for a deleted instance to be cleaned up
    pub cleanup_timeout: Duration,
    pub cleanup_poll_interval: Duration,
}

pub struct GitspaceOrchestrator {
    scm: Arc<dyn Scm>,
    connectors: Arc<dyn PlatformConnector>,
    provisioner: Arc<dyn InfraProvisioner>,
    containers: Arc<dyn ContainerOrchestrator>,
    reporter: Arc<dyn EventReporter>,
    ides: Arc<IdeFactory>,
    secrets: Arc<dyn SecretStore>,
    instances: Arc<dyn GitspaceInstanceStore>,
    settings: OrchestratorSettings,
}

impl GitspaceOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scm: Arc<dyn Scm>,
        connectors: Arc<dyn PlatformConnector>,
        provisioner: Arc<dyn InfraProvisioner>,
        containers: Arc<dyn ContainerOrchestrator>,
        reporter: Arc<dyn EventReporter>,
        ides: Arc<IdeFactory>,
        secrets: Arc<dyn SecretStore>,
        instances: Arc<dyn GitspaceInstanceStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            scm,
            connectors,
            provisioner,
            containers,
            reporter,
            ides,
            secrets,
            instances,
            settings,
        }
    }

    async fn emit(&self, config: &GitspaceConfig, event_type: GitspaceEventType) {
        self.reporter
            .emit_gitspace_event(gitspace_event(config, event_type))
            .await;
    }

    /// Ports the infra must expose: the IDE port plus the forwarded ones
    fn required_ports(
        &self,
        config: &GitspaceConfig,
        devcontainer: &DevcontainerConfig,
    ) -> Result<Vec<GitspacePort>> {
        let ide = self
            .ides
            .get(config.ide)
            .map_err(|e| e.context("unable to get IDE service while checking required gitspace ports"))?;

        let mut ports = vec![ide.port()];
        ports.extend(devcontainer.forward_ports().into_iter().map(|port| GitspacePort {
            port,
            protocol: PortProtocol::Http,
        }));
        Ok(ports)
    }

    /// Infra of the current instance, which must be in one of `expected`
    async fn provisioned_infra(
        &self,
        config: &GitspaceConfig,
        expected: &[InfraStatus],
    ) -> Result<Infrastructure> {
        let infra = self
            .provisioner
            .find(config)
            .await
            .map_err(|e| e.context("cannot find the provisioned infra"))?;

        if !expected.contains(&infra.status) {
            return Err(Error::UnexpectedInfraStatus {
                expected: format_statuses(expected),
                actual: infra.status.to_string(),
            });
        }
        if infra.storage_identifier.is_empty() {
            warn!(
                gitspace = %config.identifier,
                "Couldn't find the storage for resource {}", config.infra_provider_resource
            );
        }
        Ok(infra)
    }
}

#[async_trait]
impl Orchestrator for GitspaceOrchestrator {
    async fn trigger_start_gitspace(&self, config: &GitspaceConfig) -> GitspaceResult<()> {
        self.trigger_start(config).await
    }

    async fn trigger_stop_gitspace(&self, config: &GitspaceConfig) -> GitspaceResult<()> {
        self.trigger_stop(config).await
    }

    async fn trigger_stop_and_delete_gitspace(
        &self,
        config: &GitspaceConfig,
        can_delete_user_data: bool,
    ) -> Result<()> {
        self.trigger_stop_and_delete(config, can_delete_user_data)
            .await
    }

    async fn trigger_cleanup_instance_resources(&self, config: &GitspaceConfig) -> Result<()> {
        self.trigger_cleanup(config).await
    }

    async fn resume_start_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> GitspaceResult<()> {
        self.resume_start(config, infra).await
    }

    async fn finish_resume_start_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<GitspaceInstance> {
        self.finish_resume_start(config, infra, outcome).await
    }

    async fn finish_stop_gitspace_container(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<()> {
        self.finish_stop(config, infra, outcome).await
    }

    async fn finish_stop_and_remove_gitspace_container(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        outcome: &GitspaceOperationsEventPayload,
    ) -> GitspaceResult<()> {
        self.finish_stop_and_remove(config, infra, outcome).await
    }

    async fn resume_stop_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> GitspaceResult<GitspaceInstanceState> {
        self.resume_stop(config, infra).await
    }

    async fn resume_delete_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<GitspaceInstanceState> {
        self.resume_delete(config, infra).await
    }

    async fn resume_cleanup_instance_resources(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<GitspaceInstanceState> {
        self.resume_cleanup(config, infra).await
    }
}

/// Wrap `err` with `context`, keeping its own text as the user-facing message
fn failure(err: Error, context: impl Into<String>) -> GitspaceError {
    let message = err.to_string();
    GitspaceError::with_message(err.context(context), message)
}

fn instance_identifier(config: &GitspaceConfig) -> String {
    config
        .instance
        .as_ref()
        .map(|i| i.identifier.clone())
        .unwrap_or_default()
}
