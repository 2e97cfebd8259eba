//! Infrastructure provisioning for gitspace instances
//!
//! Every trigger returns as soon as the work is dispatched. Completion is
//! reported on the infra topic of the event bus, where the gitspace
//! orchestrator picks it up and resumes the operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::docker::ContainerEngineFactory;
use super::event_bus::EventReporter;
use super::infra_repository::InfraStore;
use crate::domain::event::{GitspaceInfraEventPayload, InfraEventType};
use crate::domain::gitspace::GitspaceConfig;
use crate::domain::ide::GitspacePort;
use crate::domain::infra::{
    InfraProviderType, InfraStatus, Infrastructure, PortMapping,
};
use crate::error::{Error, Result};

/// Provisions, stops and releases the compute a gitspace instance runs on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    /// Start provisioning; completion arrives as a `provision` infra event
    async fn trigger_provision(&self, config: &GitspaceConfig, ports: &[GitspacePort]) -> Result<()>;

    async fn trigger_stop(&self, config: &GitspaceConfig, infra: &Infrastructure) -> Result<()>;

    /// Release the infra; the storage is kept unless `can_delete_user_data`
    async fn trigger_deprovision(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        can_delete_user_data: bool,
    ) -> Result<()>;

    async fn trigger_cleanup_instance(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<()>;

    /// Infra of the latest instance of `config`
    async fn find(&self, config: &GitspaceConfig) -> Result<Infrastructure>;

    /// Record the outcome carried by an infra event
    async fn post_infra_event_complete(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        event_type: InfraEventType,
    ) -> Result<()>;
}

/// Name of the volume holding the home directory of a gitspace
pub fn storage_identifier(config: &GitspaceConfig) -> String {
    let space: String = config
        .space_path
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("gitspace-{}-{}", space, config.identifier).to_lowercase()
}

/// Provisioner for gitspaces running on the local Docker engine
pub struct DockerInfraProvisioner {
    store: Arc<dyn InfraStore>,
    engines: Arc<dyn ContainerEngineFactory>,
    reporter: Arc<dyn EventReporter>,
    gitspace_host: String,
    proxy_host: Option<String>,
    pending_timeout: Duration,
}

impl DockerInfraProvisioner {
    pub fn new(
        store: Arc<dyn InfraStore>,
        engines: Arc<dyn ContainerEngineFactory>,
        reporter: Arc<dyn EventReporter>,
        gitspace_host: String,
        proxy_host: Option<String>,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            store,
            engines,
            reporter,
            gitspace_host,
            proxy_host,
            pending_timeout,
        }
    }

    fn instance_identifier(config: &GitspaceConfig) -> Result<String> {
        Ok(config.instance()?.identifier.clone())
    }

    fn new_infra(&self, config: &GitspaceConfig, instance_identifier: String) -> Infrastructure {
        let now = Utc::now();
        Infrastructure {
            identifier: instance_identifier.clone(),
            space_path: config.space_path.clone(),
            gitspace_config_identifier: config.identifier.clone(),
            gitspace_instance_identifier: instance_identifier,
            provider_type: InfraProviderType::Docker,
            provider_resource: config.infra_provider_resource.clone(),
            agent_host: "localhost".to_string(),
            agent_port: 0,
            gitspace_host: self.gitspace_host.clone(),
            proxy_host: self.proxy_host.clone(),
            port_mappings: HashMap::new(),
            storage_identifier: storage_identifier(config),
            status: InfraStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject a provision while a younger one is still pending
    async fn check_pending(&self, instance_identifier: &str) -> Result<()> {
        let existing = match self.store.find_by_instance(instance_identifier).await {
            Ok(existing) => existing,
            Err(Error::InfraNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let timeout = chrono::Duration::from_std(self.pending_timeout)
            .unwrap_or(chrono::Duration::MAX);
        if existing.status == InfraStatus::Pending && Utc::now() - existing.updated_at < timeout {
            return Err(Error::ProvisioningError(format!(
                "there is already infra provisioning in pending state for {}",
                instance_identifier
            )));
        }
        Ok(())
    }

    async fn publish(&self, infra: Infrastructure, event_type: InfraEventType) {
        self.reporter
            .emit_infra_event(GitspaceInfraEventPayload { infra, event_type })
            .await;
    }
}

#[async_trait]
impl InfraProvisioner for DockerInfraProvisioner {
    async fn trigger_provision(&self, config: &GitspaceConfig, ports: &[GitspacePort]) -> Result<()> {
        let instance_identifier = Self::instance_identifier(config)?;
        self.check_pending(&instance_identifier).await?;

        let mut infra = self.new_infra(config, instance_identifier);
        self.store.upsert(&infra).await?;

        let engine = self.engines.engine(&infra)?;
        if let Err(e) = engine.create_volume(&infra.storage_identifier).await {
            infra.status = InfraStatus::Unknown;
            if let Err(update_err) = self.store.upsert(&infra).await {
                warn!(
                    "Unable to update infra {} after failed provision: {}",
                    infra.identifier, update_err
                );
            }
            return Err(e.context(format!(
                "unable to trigger provision infrastructure for gitspace {}",
                config.identifier
            )));
        }

        infra.port_mappings = ports
            .iter()
            .map(|p| {
                (
                    p.port,
                    PortMapping {
                        published_port: 0,
                        forwarded_port: p.port,
                    },
                )
            })
            .collect();
        infra.status = InfraStatus::Provisioned;
        infra.updated_at = Utc::now();

        info!(
            instance = %infra.gitspace_instance_identifier,
            storage = %infra.storage_identifier,
            "Provisioned docker infra"
        );
        self.publish(infra, InfraEventType::Provision).await;
        Ok(())
    }

    async fn trigger_stop(&self, _config: &GitspaceConfig, infra: &Infrastructure) -> Result<()> {
        let mut stopped = infra.clone();
        stopped.status = InfraStatus::Stopped;
        stopped.updated_at = Utc::now();
        self.publish(stopped, InfraEventType::Stop).await;
        Ok(())
    }

    async fn trigger_deprovision(
        &self,
        _config: &GitspaceConfig,
        infra: &Infrastructure,
        can_delete_user_data: bool,
    ) -> Result<()> {
        if infra.status == InfraStatus::Destroyed {
            debug!("Infra already deprovisioned for {}", infra.gitspace_instance_identifier);
        }

        if can_delete_user_data {
            let engine = self.engines.engine(infra)?;
            engine
                .remove_volume(&infra.storage_identifier)
                .await
                .map_err(|e| e.context(format!("unable to trigger deprovision infra {}", infra.identifier)))?;
        }

        let mut destroyed = infra.clone();
        destroyed.status = InfraStatus::Destroyed;
        destroyed.updated_at = Utc::now();
        self.publish(destroyed, InfraEventType::Deprovision).await;
        Ok(())
    }

    async fn trigger_cleanup_instance(
        &self,
        _config: &GitspaceConfig,
        infra: &Infrastructure,
    ) -> Result<()> {
        let mut cleaned = infra.clone();
        cleaned.status = InfraStatus::Destroyed;
        cleaned.updated_at = Utc::now();
        self.publish(cleaned, InfraEventType::Cleanup).await;
        Ok(())
    }

    async fn find(&self, config: &GitspaceConfig) -> Result<Infrastructure> {
        let instance_identifier = Self::instance_identifier(config)?;
        self.store.find_by_instance(&instance_identifier).await
    }

    async fn post_infra_event_complete(
        &self,
        _config: &GitspaceConfig,
        infra: &Infrastructure,
        event_type: InfraEventType,
    ) -> Result<()> {
        debug!(
            instance = %infra.gitspace_instance_identifier,
            event = event_type.as_str(),
            status = %infra.status,
            "Recording infra event"
        );
        self.store.upsert(infra).await
    }
}
