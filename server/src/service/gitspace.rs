//! Gitspace service
//!
//! Guards user actions against the state of the latest instance, persists the
//! transitional state and hands the actual work to the orchestrator in the
//! background. Callers only ever observe the outcome through the instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::event::{GitspaceEvent, GitspaceEventType};
use crate::domain::gitspace::{
    CreateGitspaceParams, GitspaceAccessType, GitspaceActionType, GitspaceConfig,
    GitspaceInstance, GitspaceInstanceState,
};
use crate::error::{Error, GitspaceError, Result};
use crate::infra::event_bus::{gitspace_event, EventReporter};
use crate::infra::event_repository::GitspaceEventStore;
use crate::infra::secret::SecretStore;
use crate::infra::sqlite::{GitspaceConfigStore, GitspaceInstanceStore};
use crate::service::orchestrator::Orchestrator;

/// Timing of the gitspace service
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// How long a busy instance rejects new actions
    pub busy_action_timeout: Duration,
    /// Upper bound of one background trigger
    pub provisioning_timeout: Duration,
}

/// Work dispatched in the background after a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncOp {
    Start,
    Stop,
    Reset,
    Delete,
}

impl AsyncOp {
    fn failed_event(&self) -> Option<GitspaceEventType> {
        match self {
            AsyncOp::Start => Some(GitspaceEventType::GitspaceActionStartFailed),
            AsyncOp::Stop => Some(GitspaceEventType::GitspaceActionStopFailed),
            AsyncOp::Reset => Some(GitspaceEventType::GitspaceActionResetFailed),
            AsyncOp::Delete => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AsyncOp::Start => "start",
            AsyncOp::Stop => "stop",
            AsyncOp::Reset => "reset",
            AsyncOp::Delete => "delete",
        }
    }
}

/// Move the stored instance of `config` to `error` unless it already is there.
///
/// Returns whether the instance changed.
pub(crate) async fn mark_failed(
    instances: &dyn GitspaceInstanceStore,
    reporter: &dyn EventReporter,
    config: &GitspaceConfig,
    failed_event: Option<GitspaceEventType>,
    message: &str,
) -> Result<bool> {
    let mut instance = instances.find(config.instance()?.id).await?;
    if instance.state == GitspaceInstanceState::Error {
        return Ok(false);
    }
    if let Err(err) = instance.transition_to(GitspaceInstanceState::Error) {
        warn!(
            gitspace = %config.identifier,
            "Not marking instance {} as failed: {}", instance.identifier, err
        );
        return Ok(false);
    }
    instance.error_message = Some(message.to_string());
    instances.update(&mut instance).await?;

    if let Some(event_type) = failed_event {
        let mut config = config.clone();
        config.instance = Some(instance);
        reporter
            .emit_gitspace_event(gitspace_event(&config, event_type))
            .await;
    }
    Ok(true)
}

pub struct GitspaceService {
    configs: Arc<dyn GitspaceConfigStore>,
    instances: Arc<dyn GitspaceInstanceStore>,
    events: Arc<dyn GitspaceEventStore>,
    orchestrator: Arc<dyn Orchestrator>,
    secrets: Arc<dyn SecretStore>,
    reporter: Arc<dyn EventReporter>,
    settings: ServiceSettings,
}

impl GitspaceService {
    pub fn new(
        configs: Arc<dyn GitspaceConfigStore>,
        instances: Arc<dyn GitspaceInstanceStore>,
        events: Arc<dyn GitspaceEventStore>,
        orchestrator: Arc<dyn Orchestrator>,
        secrets: Arc<dyn SecretStore>,
        reporter: Arc<dyn EventReporter>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            configs,
            instances,
            events,
            orchestrator,
            secrets,
            reporter,
            settings,
        }
    }

    pub async fn create(&self, params: CreateGitspaceParams) -> Result<GitspaceConfig> {
        if params.identifier.trim().is_empty() {
            return Err(Error::InvalidRequest("identifier must not be empty".to_string()));
        }
        if params.code_repo_url.trim().is_empty() {
            return Err(Error::InvalidRequest("code_repo_url must not be empty".to_string()));
        }

        let config = self.configs.create(params).await?;
        info!(gitspace = %config.identifier, "Created gitspace config {}", config.id);
        Ok(config)
    }

    pub async fn list(&self) -> Result<Vec<GitspaceConfig>> {
        self.configs.list_with_latest_instance().await
    }

    /// Config with its latest instance
    pub async fn find(&self, identifier: &str) -> Result<GitspaceConfig> {
        let mut config = self.configs.find_by_identifier(identifier).await?;
        config.instance = self
            .instances
            .find_latest_by_gitspace_config_id(config.id)
            .await?;
        Ok(config)
    }

    pub async fn events(&self, identifier: &str, limit: i64) -> Result<Vec<GitspaceEvent>> {
        let config = self.configs.find_by_identifier(identifier).await?;
        self.events.list(&config.identifier, limit).await
    }

    pub async fn action(
        &self,
        identifier: &str,
        action: GitspaceActionType,
    ) -> Result<GitspaceConfig> {
        let config = self.find(identifier).await?;
        info!(gitspace = %identifier, "Handling {} action", action.as_str());
        match action {
            GitspaceActionType::Start => self.start_action(config).await,
            GitspaceActionType::Stop => self.stop_action(config).await,
            GitspaceActionType::Reset => self.reset_action(config).await,
        }
    }

    async fn emit(&self, config: &GitspaceConfig, event_type: GitspaceEventType) {
        self.reporter
            .emit_gitspace_event(gitspace_event(config, event_type))
            .await;
    }

    /// Reject actions on an instance that is still busy; expire stale busy states
    async fn guard_busy(&self, config: &mut GitspaceConfig) -> Result<()> {
        let now = Utc::now();
        let Some(instance) = config.instance.as_mut() else {
            return Ok(());
        };
        if instance.is_busy_within(self.settings.busy_action_timeout, now) {
            return Err(Error::GitspaceBusy {
                identifier: config.identifier.clone(),
                state: instance.state.to_string(),
            });
        }
        if instance.state.is_busy() {
            warn!(
                gitspace = %config.identifier,
                "Instance {} stuck in {} beyond the busy timeout, marking it as failed",
                instance.identifier, instance.state
            );
            let stale = instance.state;
            instance.transition_to(GitspaceInstanceState::Error)?;
            instance.error_message = Some(format!(
                "gitspace stayed {} for longer than {:?}",
                stale, self.settings.busy_action_timeout
            ));
            self.instances.update(instance).await?;
        }
        Ok(())
    }

    /// Fresh instance for a start, carrying over what survives between runs
    async fn new_instance(&self, config: &GitspaceConfig) -> Result<GitspaceInstance> {
        let mut instance = GitspaceInstance::new_for(config);
        instance.has_git_changes = config.instance.as_ref().and_then(|i| i.has_git_changes);

        if instance.access_type == GitspaceAccessType::UserCredentials {
            let reference = format!("{}-access", instance.identifier);
            let password = Uuid::new_v4().simple().to_string();
            self.secrets
                .put(&config.space_path, &reference, &password)
                .await
                .map_err(|e| e.context("failed to store the gitspace access key"))?;
            instance.access_key_ref = Some(reference);
        }

        self.instances.create(&instance).await
    }

    pub async fn start_action(&self, mut config: GitspaceConfig) -> Result<GitspaceConfig> {
        self.guard_busy(&mut config).await?;

        match config.instance.as_ref().map(|i| i.state) {
            Some(GitspaceInstanceState::Running) => {
                info!(gitspace = %config.identifier, "Gitspace is already running");
                return Ok(config);
            }
            Some(state) if !state.is_final() => {}
            _ => {
                let instance = self.new_instance(&config).await?;
                config.instance = Some(instance);
            }
        }

        let instance = config.instance_mut()?;
        instance.transition_to(GitspaceInstanceState::Starting)?;
        instance.error_message = None;
        self.instances.update(instance).await?;

        self.emit(&config, GitspaceEventType::GitspaceActionStart).await;
        self.submit_async(config.clone(), AsyncOp::Start);
        Ok(config)
    }

    pub async fn stop_action(&self, mut config: GitspaceConfig) -> Result<GitspaceConfig> {
        self.guard_busy(&mut config).await?;

        let instance = config.instance_mut()?;
        if instance.state != GitspaceInstanceState::Running {
            return Err(Error::InvalidInstanceState {
                expected: GitspaceInstanceState::Running.to_string(),
                actual: instance.state.to_string(),
            });
        }
        instance.accrue_active_time(Utc::now());
        instance.transition_to(GitspaceInstanceState::Stopping)?;
        self.instances.update(instance).await?;

        self.emit(&config, GitspaceEventType::GitspaceActionStop).await;
        self.submit_async(config.clone(), AsyncOp::Stop);
        Ok(config)
    }

    /// Delete the instance without its user data; the deprovision handler starts it again
    pub async fn reset_action(&self, mut config: GitspaceConfig) -> Result<GitspaceConfig> {
        self.guard_busy(&mut config).await?;

        let state = config.instance()?.state;
        if !state.can_transition_to(GitspaceInstanceState::Cleaning) {
            return Err(Error::InvalidInstanceState {
                expected: "running, stopped or error".to_string(),
                actual: state.to_string(),
            });
        }

        config.is_marked_for_reset = true;
        self.configs.update(&config).await?;

        let instance = config.instance_mut()?;
        if instance.state == GitspaceInstanceState::Running {
            instance.accrue_active_time(Utc::now());
        }
        instance.transition_to(GitspaceInstanceState::Cleaning)?;
        self.instances.update(instance).await?;

        self.emit(&config, GitspaceEventType::GitspaceActionReset).await;
        self.submit_async(config.clone(), AsyncOp::Reset);
        Ok(config)
    }

    /// Soft delete the config and release whatever its latest instance holds
    pub async fn delete(&self, identifier: &str) -> Result<()> {
        let mut config = self.find(identifier).await?;
        self.guard_busy(&mut config).await?;

        let mut release = false;
        if let Some(instance) = config.instance.as_mut() {
            if instance.state.can_transition_to(GitspaceInstanceState::Cleaning) {
                if instance.state == GitspaceInstanceState::Running {
                    instance.accrue_active_time(Utc::now());
                }
                instance.transition_to(GitspaceInstanceState::Cleaning)?;
                release = true;
            } else if instance.state != GitspaceInstanceState::Deleted {
                // Nothing was provisioned for it
                instance.transition_to(GitspaceInstanceState::Deleted)?;
            }
            self.instances.update(instance).await?;
        }

        self.configs.delete(config.id).await?;
        config.is_deleted = true;
        info!(gitspace = %identifier, "Deleted gitspace config {}", config.id);

        if release {
            self.submit_async(config, AsyncOp::Delete);
        }
        Ok(())
    }

    /// Start again after a reset released the previous instance
    pub async fn restart_after_reset(&self, config: &GitspaceConfig) -> Result<()> {
        let mut config = self.find(&config.identifier).await?;
        config.is_marked_for_reset = false;
        self.configs.update(&config).await?;

        let config = self.start_action(config).await?;
        self.emit(&config, GitspaceEventType::GitspaceActionResetCompleted)
            .await;
        Ok(())
    }

    /// Expire instances stuck in a busy state; stuck cleanups release their resources instead
    pub async fn run_cleanup_job(&self) -> Result<()> {
        let now = Utc::now();
        for instance in self.instances.list_active().await? {
            if !instance.state.is_busy()
                || instance.is_busy_within(self.settings.busy_action_timeout, now)
            {
                continue;
            }

            let mut config = match self.configs.find(instance.gitspace_config_id).await {
                Ok(config) => config,
                Err(err) => {
                    warn!("Skipping instance {} without config: {}", instance.identifier, err);
                    continue;
                }
            };
            let state = instance.state;
            config.instance = Some(instance);
            self.emit(&config, GitspaceEventType::GitspaceCleanupJob).await;

            let message = if state == GitspaceInstanceState::Cleaning {
                match self
                    .orchestrator
                    .trigger_cleanup_instance_resources(&config)
                    .await
                {
                    Ok(()) => continue,
                    Err(err) => err.to_string(),
                }
            } else {
                format!(
                    "gitspace stayed {} for longer than {:?}",
                    state, self.settings.busy_action_timeout
                )
            };

            warn!(gitspace = %config.identifier, "Cleanup job failing instance: {}", message);
            mark_failed(
                self.instances.as_ref(),
                self.reporter.as_ref(),
                &config,
                None,
                &message,
            )
            .await?;
        }
        Ok(())
    }

    /// Run `op` in the background, failing the instance if it errors or overruns
    fn submit_async(&self, config: GitspaceConfig, op: AsyncOp) {
        let orchestrator = self.orchestrator.clone();
        let instances = self.instances.clone();
        let reporter = self.reporter.clone();
        let timeout = self.settings.provisioning_timeout;

        tokio::spawn(async move {
            let run = async {
                match op {
                    AsyncOp::Start => orchestrator.trigger_start_gitspace(&config).await,
                    AsyncOp::Stop => orchestrator.trigger_stop_gitspace(&config).await,
                    AsyncOp::Reset => orchestrator
                        .trigger_stop_and_delete_gitspace(&config, false)
                        .await
                        .map_err(GitspaceError::new),
                    AsyncOp::Delete => orchestrator
                        .trigger_stop_and_delete_gitspace(&config, true)
                        .await
                        .map_err(GitspaceError::new),
                }
            };

            let err = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err,
                Err(_) => GitspaceError::new(Error::Timeout(format!(
                    "{} of gitspace {} did not finish within {:?}",
                    op.as_str(),
                    config.identifier,
                    timeout
                ))),
            };

            error!(
                gitspace = %config.identifier,
                "Failed to {} gitspace: {}", op.as_str(), err
            );
            if let Err(e) = mark_failed(
                instances.as_ref(),
                reporter.as_ref(),
                &config,
                op.failed_event(),
                &err.message(),
            )
            .await
            {
                error!(gitspace = %config.identifier, "Failed to mark gitspace as failed: {}", e);
            }
        });
    }
}
