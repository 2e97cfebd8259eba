//! Event bus consumers
//!
//! Gitspace events are persisted for the events API. Infra and operations
//! events resume the orchestrator and store the instance state it decides.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::domain::event::{
    GitspaceEvent, GitspaceEventPayload, GitspaceEventType, GitspaceInfraEventPayload,
    GitspaceOperationsEventPayload, InfraEventType, OperationEventType,
};
use crate::domain::gitspace::{GitspaceConfig, GitspaceInstanceState};
use crate::error::Result;
use crate::infra::event_bus::{EventHandlers, EventReporter};
use crate::infra::event_repository::GitspaceEventStore;
use crate::infra::sqlite::{GitspaceConfigStore, GitspaceInstanceStore};
use crate::service::gitspace::{mark_failed, GitspaceService};
use crate::service::orchestrator::Orchestrator;

pub struct GitspaceEventHandler {
    configs: Arc<dyn GitspaceConfigStore>,
    instances: Arc<dyn GitspaceInstanceStore>,
    events: Arc<dyn GitspaceEventStore>,
    orchestrator: Arc<dyn Orchestrator>,
    reporter: Arc<dyn EventReporter>,
    service: Arc<GitspaceService>,
}

impl GitspaceEventHandler {
    pub fn new(
        configs: Arc<dyn GitspaceConfigStore>,
        instances: Arc<dyn GitspaceInstanceStore>,
        events: Arc<dyn GitspaceEventStore>,
        orchestrator: Arc<dyn Orchestrator>,
        reporter: Arc<dyn EventReporter>,
        service: Arc<GitspaceService>,
    ) -> Self {
        Self {
            configs,
            instances,
            events,
            orchestrator,
            reporter,
            service,
        }
    }

    /// Handlers to register on the event bus
    pub fn handlers(self: Arc<Self>) -> EventHandlers {
        let gitspace = self.clone();
        let infra = self.clone();
        let operations = self;
        EventHandlers {
            gitspace: Arc::new(move |payload: GitspaceEventPayload| {
                let handler = gitspace.clone();
                async move { handler.on_gitspace_event(payload).await }.boxed()
            }),
            infra: Arc::new(move |payload: GitspaceInfraEventPayload| {
                let handler = infra.clone();
                async move { handler.on_infra_event(payload).await }.boxed()
            }),
            operations: Arc::new(move |payload: GitspaceOperationsEventPayload| {
                let handler = operations.clone();
                async move { handler.on_operations_event(payload).await }.boxed()
            }),
        }
    }

    pub async fn on_gitspace_event(&self, payload: GitspaceEventPayload) -> Result<()> {
        let event = GitspaceEvent {
            id: 0,
            event: payload.event_type,
            message: payload.event_type.message().to_string(),
            entity_id: payload.entity_id,
            query_key: payload.query_key,
            entity_type: payload.entity_type,
            timestamp: payload.timestamp,
            created_at: Utc::now(),
        };
        self.events.create(&event).await?;
        Ok(())
    }

    /// Config of an instance, soft deleted or not, with that instance attached
    async fn load(&self, instance_identifier: &str) -> Result<GitspaceConfig> {
        let instance = self.instances.find_by_identifier(instance_identifier).await?;
        let mut config = self.configs.find(instance.gitspace_config_id).await?;
        config.instance = Some(instance);
        Ok(config)
    }

    /// Store `state` on the instance of `config`
    async fn persist_state(
        &self,
        config: &mut GitspaceConfig,
        state: GitspaceInstanceState,
    ) -> Result<()> {
        let instance = config.instance_mut()?;
        instance.transition_to(state)?;
        if state == GitspaceInstanceState::Stopped {
            instance.active_time_ended.get_or_insert_with(Utc::now);
        }
        self.instances.update(instance).await
    }

    async fn fail(
        &self,
        config: &GitspaceConfig,
        failed_event: Option<GitspaceEventType>,
        message: &str,
    ) -> Result<()> {
        warn!(gitspace = %config.identifier, "Gitspace operation failed: {}", message);
        mark_failed(
            self.instances.as_ref(),
            self.reporter.as_ref(),
            config,
            failed_event,
            message,
        )
        .await
        .map(|_| ())
    }

    pub async fn on_infra_event(&self, payload: GitspaceInfraEventPayload) -> Result<()> {
        let infra = payload.infra;
        let mut config = self.load(&infra.gitspace_instance_identifier).await?;
        let state = config.instance()?.state;
        debug!(
            gitspace = %config.identifier,
            "Infra {} event for instance in state {}",
            payload.event_type.as_str(),
            state
        );

        match payload.event_type {
            InfraEventType::Provision => {
                if state != GitspaceInstanceState::Starting {
                    warn!(
                        gitspace = %config.identifier,
                        "Ignoring provision of instance {} in state {}",
                        infra.gitspace_instance_identifier,
                        state
                    );
                    return Ok(());
                }
                if let Err(err) = self.orchestrator.resume_start_gitspace(&config, &infra).await {
                    self.fail(
                        &config,
                        Some(GitspaceEventType::GitspaceActionStartFailed),
                        &err.message(),
                    )
                    .await?;
                }
            }
            InfraEventType::Stop => {
                match self.orchestrator.resume_stop_gitspace(&config, &infra).await {
                    Ok(next) => self.persist_state(&mut config, next).await?,
                    Err(err) => {
                        self.fail(
                            &config,
                            Some(GitspaceEventType::GitspaceActionStopFailed),
                            &err.message(),
                        )
                        .await?
                    }
                }
            }
            InfraEventType::Deprovision => {
                match self.orchestrator.resume_delete_gitspace(&config, &infra).await {
                    Ok(next) => {
                        self.persist_state(&mut config, next).await?;
                        if config.is_marked_for_reset && !config.is_deleted {
                            info!(gitspace = %config.identifier, "Starting gitspace again after reset");
                            self.service.restart_after_reset(&config).await?;
                        }
                    }
                    Err(err) => {
                        let failed = config
                            .is_marked_for_reset
                            .then_some(GitspaceEventType::GitspaceActionResetFailed);
                        self.fail(&config, failed, &err.to_string()).await?
                    }
                }
            }
            InfraEventType::Cleanup => {
                match self
                    .orchestrator
                    .resume_cleanup_instance_resources(&config, &infra)
                    .await
                {
                    Ok(next) => self.persist_state(&mut config, next).await?,
                    Err(err) => self.fail(&config, None, &err.to_string()).await?,
                }
            }
        }
        Ok(())
    }

    pub async fn on_operations_event(&self, payload: GitspaceOperationsEventPayload) -> Result<()> {
        let config = self.load(&payload.gitspace_instance_identifier).await?;
        let infra = &payload.infra;

        match payload.event_type {
            OperationEventType::Start => {
                match self
                    .orchestrator
                    .finish_resume_start_gitspace(&config, infra, &payload)
                    .await
                {
                    Ok(mut instance) => {
                        self.instances.update(&mut instance).await?;
                        info!(
                            gitspace = %config.identifier,
                            "Gitspace instance {} is running", instance.identifier
                        );
                    }
                    Err(err) => {
                        self.fail(
                            &config,
                            Some(GitspaceEventType::GitspaceActionStartFailed),
                            &err.message(),
                        )
                        .await?
                    }
                }
            }
            OperationEventType::Stop => {
                if let Err(err) = self
                    .orchestrator
                    .finish_stop_gitspace_container(&config, infra, &payload)
                    .await
                {
                    self.fail(
                        &config,
                        Some(GitspaceEventType::GitspaceActionStopFailed),
                        &err.message(),
                    )
                    .await?;
                }
            }
            OperationEventType::Delete => {
                if let Err(err) = self
                    .orchestrator
                    .finish_stop_and_remove_gitspace_container(&config, infra, &payload)
                    .await
                {
                    let failed = config
                        .is_marked_for_reset
                        .then_some(GitspaceEventType::GitspaceActionResetFailed);
                    self.fail(&config, failed, &err.message()).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::container::ContainerStartResponse;
    use crate::domain::event::{GitspaceEntityType, OperationStatus};
    use crate::domain::ide::IdeType;
    use crate::domain::infra::InfraStatus;
    use crate::error::{Error, GitspaceError};
    use crate::infra::event_bus::testing::RecordingReporter;
    use crate::infra::event_repository::MockGitspaceEventStore;
    use crate::infra::secret::MockSecretStore;
    use crate::infra::sqlite::{MockGitspaceConfigStore, MockGitspaceInstanceStore};
    use crate::service::gitspace::ServiceSettings;
    use crate::service::orchestrator::testing::{config, infra};
    use crate::service::orchestrator::MockOrchestrator;

    struct Mocks {
        configs: MockGitspaceConfigStore,
        instances: MockGitspaceInstanceStore,
        events: MockGitspaceEventStore,
        orchestrator: MockOrchestrator,
    }

    impl Mocks {
        fn new(state: GitspaceInstanceState) -> Self {
            let mut instances = MockGitspaceInstanceStore::new();
            instances
                .expect_find_by_identifier()
                .returning(move |_| Ok(config(IdeType::VsCodeWeb, state).instance.unwrap()));
            let mut configs = MockGitspaceConfigStore::new();
            configs
                .expect_find()
                .returning(move |_| Ok(config(IdeType::VsCodeWeb, state)));
            Self {
                configs,
                instances,
                events: MockGitspaceEventStore::new(),
                orchestrator: MockOrchestrator::new(),
            }
        }

        fn build(self, reporter: Arc<RecordingReporter>) -> GitspaceEventHandler {
            let configs: Arc<dyn GitspaceConfigStore> = Arc::new(self.configs);
            let instances: Arc<dyn GitspaceInstanceStore> = Arc::new(self.instances);
            let events: Arc<dyn GitspaceEventStore> = Arc::new(self.events);
            let orchestrator: Arc<dyn Orchestrator> = Arc::new(self.orchestrator);
            let service = Arc::new(GitspaceService::new(
                configs.clone(),
                instances.clone(),
                events.clone(),
                orchestrator.clone(),
                Arc::new(MockSecretStore::new()),
                reporter.clone(),
                ServiceSettings {
                    busy_action_timeout: Duration::from_secs(3600),
                    provisioning_timeout: Duration::from_secs(1),
                },
            ));
            GitspaceEventHandler::new(configs, instances, events, orchestrator, reporter, service)
        }
    }

    fn infra_event(event_type: InfraEventType, status: InfraStatus) -> GitspaceInfraEventPayload {
        GitspaceInfraEventPayload {
            infra: infra(status, 8089),
            event_type,
        }
    }

    fn operation(event_type: OperationEventType, status: OperationStatus) -> GitspaceOperationsEventPayload {
        GitspaceOperationsEventPayload {
            gitspace_config_identifier: "app".to_string(),
            gitspace_instance_identifier: "app-0000beef".to_string(),
            event_type,
            status,
            error_message: None,
            response: None,
            can_delete_user_data: true,
            infra: infra(InfraStatus::Provisioned, 8089),
        }
    }

    #[tokio::test]
    async fn test_gitspace_events_are_persisted() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Starting);
        mocks
            .events
            .expect_create()
            .withf(|event| {
                event.event == GitspaceEventType::InfraStopStart
                    && event.message == GitspaceEventType::InfraStopStart.message()
                    && event.query_key == "app"
            })
            .times(1)
            .returning(|event| Ok(event.clone()));

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        handler
            .on_gitspace_event(GitspaceEventPayload {
                query_key: "app".to_string(),
                entity_id: 11,
                entity_type: GitspaceEntityType::GitspaceInstance,
                event_type: GitspaceEventType::InfraStopStart,
                timestamp: 1,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provision_resumes_start() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Starting);
        mocks
            .orchestrator
            .expect_resume_start_gitspace()
            .times(1)
            .returning(|_, _| Ok(()));
        mocks.instances.expect_update().never();

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        handler
            .on_infra_event(infra_event(InfraEventType::Provision, InfraStatus::Provisioned))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_provision_of_stale_instance_is_ignored() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Error);
        mocks.orchestrator.expect_resume_start_gitspace().never();

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        handler
            .on_infra_event(infra_event(InfraEventType::Provision, InfraStatus::Provisioned))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_resume_marks_instance_failed() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Starting);
        mocks
            .orchestrator
            .expect_resume_start_gitspace()
            .returning(|_, _| {
                Err(GitspaceError::with_message(
                    Error::ScmError("not found".to_string()),
                    "repository not found",
                ))
            });
        mocks.instances.expect_find().returning(|_| {
            Ok(config(IdeType::VsCodeWeb, GitspaceInstanceState::Starting)
                .instance
                .unwrap())
        });
        mocks
            .instances
            .expect_update()
            .withf(|instance| {
                instance.state == GitspaceInstanceState::Error
                    && instance.error_message.as_deref() == Some("repository not found")
            })
            .times(1)
            .returning(|_| Ok(()));

        let reporter = Arc::new(RecordingReporter::default());
        let handler = mocks.build(reporter.clone());
        handler
            .on_infra_event(infra_event(InfraEventType::Provision, InfraStatus::Provisioned))
            .await
            .unwrap();
        assert_eq!(
            reporter.event_types(),
            vec![GitspaceEventType::GitspaceActionStartFailed]
        );
    }

    #[tokio::test]
    async fn test_stop_persists_stopped_state() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Stopping);
        mocks
            .orchestrator
            .expect_resume_stop_gitspace()
            .returning(|_, _| Ok(GitspaceInstanceState::Stopped));
        mocks
            .instances
            .expect_update()
            .withf(|instance| instance.state == GitspaceInstanceState::Stopped)
            .times(1)
            .returning(|_| Ok(()));

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        handler
            .on_infra_event(infra_event(InfraEventType::Stop, InfraStatus::Stopped))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deprovision_marks_instance_deleted() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Cleaning);
        mocks
            .orchestrator
            .expect_resume_delete_gitspace()
            .returning(|_, _| Ok(GitspaceInstanceState::Deleted));
        mocks
            .instances
            .expect_update()
            .withf(|instance| instance.state == GitspaceInstanceState::Deleted)
            .times(1)
            .returning(|_| Ok(()));
        mocks.configs.expect_update().never();

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        handler
            .on_infra_event(infra_event(InfraEventType::Deprovision, InfraStatus::Destroyed))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_outcome_stores_running_instance() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Starting);
        mocks
            .orchestrator
            .expect_finish_resume_start_gitspace()
            .returning(|config, _, _| {
                let mut instance = config.instance.clone().unwrap();
                instance.state = GitspaceInstanceState::Running;
                instance.url = Some("http://localhost:32768?folder=/home/gitspace/app".to_string());
                Ok(instance)
            });
        mocks
            .instances
            .expect_update()
            .withf(|instance| {
                instance.state == GitspaceInstanceState::Running && instance.url.is_some()
            })
            .times(1)
            .returning(|_| Ok(()));

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        let mut payload = operation(OperationEventType::Start, OperationStatus::Success);
        payload.response = Some(ContainerStartResponse {
            container_id: "c0ffee".to_string(),
            container_name: "gitspace-alice-app".to_string(),
            published_ports: Default::default(),
            absolute_repo_path: "/home/gitspace/app".to_string(),
            remote_user: "gitspace".to_string(),
        });
        handler.on_operations_event(payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_outcome_triggers_deprovision() {
        let mut mocks = Mocks::new(GitspaceInstanceState::Cleaning);
        mocks
            .orchestrator
            .expect_finish_stop_and_remove_gitspace_container()
            .times(1)
            .returning(|_, _, _| Ok(()));
        mocks.instances.expect_update().never();

        let handler = mocks.build(Arc::new(RecordingReporter::default()));
        handler
            .on_operations_event(operation(OperationEventType::Delete, OperationStatus::Success))
            .await
            .unwrap();
    }
}
