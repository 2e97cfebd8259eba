//! Container orchestration for the embedded Docker provider

pub mod create;
pub mod exec;
pub mod features_build;
pub mod image;
pub mod lifecycle;
pub mod run_args;
pub mod setup;
pub mod steps;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::create::ContainerBlueprint;
use self::exec::Exec;
use self::features_build::build_features_image;
use self::image::{pull_image, registry_auth, resolve_users, ImageMetadata};
use self::lifecycle::hooks_from_labels;
use self::run_args::{default_definitions, RunArgs};
use self::setup::{build_setup_steps, execute_lifecycle_commands, setup_git_credentials, SetupContext};
use self::steps::execute_steps;
use crate::domain::container::{
    user_home_dir, ContainerStartResponse, ContainerState, PostAction, REMOTE_USER_LABEL,
};
use crate::domain::devcontainer::DevcontainerConfig;
use crate::domain::event::{GitspaceOperationsEventPayload, OperationEventType, OperationStatus};
use crate::domain::gitspace::GitspaceConfig;
use crate::domain::ide::IdeArgs;
use crate::domain::infra::{Infrastructure, PortMapping};
use crate::domain::run_arg::{RunArg, RunArgDefinition};
use crate::error::{Error, Result};
use crate::infra::connector::ConnectorDetails;
use crate::infra::docker::{ContainerEngine, ContainerEngineFactory};
use crate::infra::event_bus::EventReporter;
use crate::infra::scm::ResolvedDetails;
use crate::infra::template::ScriptTemplates;
use crate::service::feature::{install_order, FeatureDownloader};
use crate::service::ide::IdeService;
use crate::service::logger::{log_and_wrap, GitspaceLogger, TracingLogger};

/// Name of the container backing `config`
pub fn container_name(config: &GitspaceConfig) -> String {
    format!("gitspace-{}-{}", config.user_identifier, config.identifier)
}

/// IDE arguments derived from the devcontainer customizations
pub fn ide_args(devcontainer: &DevcontainerConfig, repo_name: &str) -> IdeArgs {
    let customizations = &devcontainer.customizations;
    IdeArgs {
        repo_name: repo_name.to_string(),
        vscode_extensions: customizations
            .vscode
            .as_ref()
            .map(|v| v.extensions.clone())
            .unwrap_or_default(),
        jetbrains_plugins: customizations
            .jetbrains
            .as_ref()
            .map(|j| j.plugins.clone())
            .unwrap_or_default(),
        jetbrains_download_url: customizations
            .jetbrains
            .as_ref()
            .and_then(|j| j.backend_download_url.clone()),
    }
}

/// Current state of the container called `name`
pub async fn container_state(engine: &dyn ContainerEngine, name: &str) -> Result<ContainerState> {
    let containers = engine.list_containers_by_name(name).await?;
    let wanted = format!("/{}", name);
    let summary = containers
        .iter()
        .find(|c| c.names.iter().any(|n| n == name || *n == wanted));
    Ok(match summary {
        None => ContainerState::Removed,
        Some(summary) => ContainerState::from_engine(&summary.state),
    })
}

/// Everything needed to bring up the container of one gitspace instance
pub struct StartRequest {
    pub config: GitspaceConfig,
    pub infra: Infrastructure,
    pub repo: ResolvedDetails,
    pub devcontainer: DevcontainerConfig,
    pub default_base_image: String,
    pub ide: Arc<dyn IdeService>,
    pub connectors: Vec<ConnectorDetails>,
    /// Password or public key installed for the remote user
    pub access_key: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    /// Start the gitspace container, creating and setting it up when needed.
    ///
    /// The outcome is also published as a start operations event.
    async fn create_and_start_gitspace(&self, request: StartRequest) -> Result<()>;

    async fn stop_gitspace(&self, config: &GitspaceConfig, infra: &Infrastructure) -> Result<()>;

    /// Stop the container if needed and remove it
    async fn stop_and_remove_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        can_delete_user_data: bool,
    ) -> Result<()>;

    /// Whether the engine of `infra` is reachable
    async fn status(&self, infra: &Infrastructure) -> Result<()>;
}

pub struct EmbeddedDockerOrchestrator {
    engines: Arc<dyn ContainerEngineFactory>,
    templates: Arc<ScriptTemplates>,
    features: Arc<FeatureDownloader>,
    reporter: Arc<dyn EventReporter>,
    run_arg_definitions: HashMap<RunArg, RunArgDefinition>,
    cancel: CancellationToken,
}

impl EmbeddedDockerOrchestrator {
    pub fn new(
        engines: Arc<dyn ContainerEngineFactory>,
        templates: Arc<ScriptTemplates>,
        features: Arc<FeatureDownloader>,
        reporter: Arc<dyn EventReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engines,
            templates,
            features,
            reporter,
            run_arg_definitions: default_definitions(),
            cancel,
        }
    }

    async fn emit(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        event_type: OperationEventType,
        outcome: std::result::Result<Option<ContainerStartResponse>, &Error>,
        can_delete_user_data: bool,
    ) {
        let (status, error_message, response) = match outcome {
            Ok(response) => (OperationStatus::Success, None, response),
            Err(err) => (OperationStatus::Failure, Some(err.to_string()), None),
        };
        self.reporter
            .emit_operations_event(GitspaceOperationsEventPayload {
                gitspace_config_identifier: config.identifier.clone(),
                gitspace_instance_identifier: config
                    .instance
                    .as_ref()
                    .map(|i| i.identifier.clone())
                    .unwrap_or_default(),
                event_type,
                status,
                error_message,
                response,
                can_delete_user_data,
                infra: infra.clone(),
            })
            .await;
    }

    fn logger(config: &GitspaceConfig) -> TracingLogger {
        TracingLogger::new(
            config
                .instance
                .as_ref()
                .map(|i| i.identifier.clone())
                .unwrap_or_else(|| config.identifier.clone()),
        )
    }

    async fn start(&self, request: &StartRequest, engine: Arc<dyn ContainerEngine>) -> Result<ContainerStartResponse> {
        let name = container_name(&request.config);
        let logger = Self::logger(&request.config);

        let state = container_state(engine.as_ref(), &name).await?;
        debug!(container = %name, state = %state, "Checked gitspace container state");

        match state {
            ContainerState::Running => {
                logger.debug("Gitspace is already running");
            }
            ContainerState::Stopped => {
                self.start_stopped_gitspace(request, engine.clone(), &name, &logger)
                    .await?;
            }
            ContainerState::Removed => {
                self.create_and_start_new_gitspace(request, engine.clone(), &name, &logger)
                    .await
                    .map_err(|e| e.context(format!("failed to start gitspace {}", request.config.identifier)))?;
            }
            other => {
                return Err(Error::UnhandledContainerState {
                    container: name,
                    state: other.to_string(),
                });
            }
        }

        container_response(engine.as_ref(), &name, &request.infra, &request.devcontainer, &request.repo.repo_name)
            .await
    }

    fn exec_for(
        &self,
        request: &StartRequest,
        engine: Arc<dyn ContainerEngine>,
        name: &str,
        remote_user: &str,
    ) -> Exec {
        Exec::new(
            engine,
            self.cancel.child_token(),
            name,
            remote_user,
            user_home_dir(remote_user),
        )
        .with_access(request.config.access_type(), request.access_key.clone())
    }

    /// Restart path: bring back the IDE without redoing the setup
    async fn start_stopped_gitspace(
        &self,
        request: &StartRequest,
        engine: Arc<dyn ContainerEngine>,
        name: &str,
        logger: &dyn GitspaceLogger,
    ) -> Result<()> {
        let details = engine
            .inspect_container(name)
            .await
            .map_err(|e| e.context(format!("could not inspect container {}", name)))?;
        let remote_user = details
            .labels
            .get(REMOTE_USER_LABEL)
            .filter(|u| !u.is_empty())
            .cloned()
            .unwrap_or_else(|| "root".to_string());
        let hooks = hooks_from_labels(&details.labels)?;

        engine
            .start_container(name)
            .await
            .map_err(|e| log_and_wrap(logger, "Error while starting container", e))?;
        logger.info("Successfully started container");

        let exec = self.exec_for(request, engine, name, &remote_user);

        if let Some(credentials) = &request.repo.credentials {
            setup_git_credentials(&self.templates, &exec, &request.repo.clone_url, credentials, logger)
                .await?;
        }

        let args = ide_args(&request.devcontainer, &request.repo.repo_name);
        request.ide.run(&exec, &args, logger).await?;

        // Containers created before the hooks label existed fall back to devcontainer.json
        let from_labels: Vec<Vec<String>> = hooks
            .and_then(|mut hooks| hooks.remove(&PostAction::PostStart))
            .unwrap_or_default()
            .iter()
            .map(|hook| hook.command.to_command_array())
            .collect();
        let post_start = if from_labels.is_empty() {
            vec![request.devcontainer.post_start_command.to_command_array()]
        } else {
            from_labels
        };

        let repo_dir = format!("{}/{}", user_home_dir(&remote_user), request.repo.repo_name);
        for commands in post_start {
            if let Err(err) =
                execute_lifecycle_commands(&exec, &repo_dir, &commands, PostAction::PostStart, logger).await
            {
                logger.warn(&format!("Error in post-start command, continuing: {}", err));
            }
        }
        Ok(())
    }

    /// Full path: pull, create, start and set up a new container
    async fn create_and_start_new_gitspace(
        &self,
        request: &StartRequest,
        engine: Arc<dyn ContainerEngine>,
        name: &str,
        logger: &dyn GitspaceLogger,
    ) -> Result<()> {
        let devcontainer = &request.devcontainer;
        let instance_identifier = request.config.instance()?.identifier.clone();

        let run_args =
            RunArgs::extract_with_logging(&self.run_arg_definitions, &devcontainer.run_args, logger)?;

        let mut image = devcontainer.image_or(&request.default_base_image).to_string();
        pull_image(
            engine.as_ref(),
            &image,
            run_args.pull_policy(),
            registry_auth(&image, &request.connectors),
            logger,
        )
        .await?;

        let image_data = engine.inspect_image(&image).await?;
        let metadata = ImageMetadata::from_image(&image_data)?;

        let mut port_mappings = request.infra.port_mappings.clone();
        let forward_ports = devcontainer.forward_ports();
        if !forward_ports.is_empty() {
            for port in &forward_ports {
                port_mappings.insert(
                    *port,
                    PortMapping {
                        published_port: *port,
                        forwarded_port: *port,
                    },
                );
            }
            logger.info(&format!("Forwarding ports: {:?}", forward_ports));
        }

        let users = resolve_users(&run_args, devcontainer, &metadata, &image_data);
        logger.info(&format!("Container user: {}", users.container_user));
        logger.info(&format!("Remote user: {}", users.remote_user));

        let features = install_order(
            &self.features,
            &instance_identifier,
            devcontainer,
            logger,
            &self.cancel,
        )
        .await?;
        if features.is_empty() {
            logger.info("No features found");
        } else {
            image = build_features_image(
                engine.as_ref(),
                &self.templates,
                &instance_identifier,
                &image,
                &features,
                &users,
                logger,
            )
            .await?;
        }

        let home_dir = user_home_dir(&users.remote_user);
        let blueprint = ContainerBlueprint {
            image: &image,
            storage: &request.infra.storage_identifier,
            home_dir: &home_dir,
            port_mappings: &port_mappings,
            run_args: &run_args,
            users: &users,
            features: &features,
            devcontainer,
            metadata: &metadata,
        };
        let environment = blueprint.env();
        if !environment.is_empty() {
            logger.info(&format!("Setting environment: {}", environment.join(", ")));
        }
        let (container_config, hooks) = blueprint
            .build()
            .map_err(|e| log_and_wrap(logger, "Error while preparing container config", e))?;

        engine
            .create_container(name, container_config)
            .await
            .map_err(|e| log_and_wrap(logger, "Error while creating container", e))?;
        logger.info(&format!("Created container {}", name));

        engine
            .start_container(name)
            .await
            .map_err(|e| log_and_wrap(logger, "Error while starting container", e))?;
        logger.info("Successfully started container");

        let exec = self
            .exec_for(request, engine, name, &users.remote_user)
            .with_platform(image_data.os.clone(), image_data.arch.clone());

        let ctx = SetupContext {
            templates: &self.templates,
            ide: request.ide.as_ref(),
            ide_args: ide_args(devcontainer, &request.repo.repo_name),
            repo: &request.repo,
            default_base_image: &request.default_base_image,
            devcontainer_present: *devcontainer != DevcontainerConfig::default(),
            environment,
            repo_dir: format!("{}/{}", home_dir, request.repo.repo_name),
            hooks,
        };
        execute_steps(build_setup_steps(&ctx, &exec, logger), logger)
            .await
            .map_err(|e| log_and_wrap(logger, "Error while setting up gitspace", e))
    }
}

/// Container id, published ports and repository location after a start
pub async fn container_response(
    engine: &dyn ContainerEngine,
    name: &str,
    infra: &Infrastructure,
    devcontainer: &DevcontainerConfig,
    repo_name: &str,
) -> Result<ContainerStartResponse> {
    let details = engine.inspect_container(name).await?;
    let remote_user = details
        .labels
        .get(REMOTE_USER_LABEL)
        .filter(|u| !u.is_empty())
        .cloned()
        .unwrap_or_else(|| "root".to_string());

    let mut ports: Vec<u16> = infra.port_mappings.keys().copied().collect();
    ports.extend(devcontainer.forward_ports());
    let published_ports = ports
        .into_iter()
        .filter_map(|port| {
            details
                .port_bindings
                .get(&format!("{}/tcp", port))
                .map(|host| (port, host.clone()))
        })
        .collect();

    Ok(ContainerStartResponse {
        container_id: details.id,
        container_name: details.name,
        published_ports,
        absolute_repo_path: format!("{}/{}", user_home_dir(&remote_user), repo_name),
        remote_user,
    })
}

#[async_trait]
impl ContainerOrchestrator for EmbeddedDockerOrchestrator {
    async fn create_and_start_gitspace(&self, request: StartRequest) -> Result<()> {
        let engine = match self.engines.engine(&request.infra) {
            Ok(engine) => engine,
            Err(err) => {
                let err = err.context("error getting container engine");
                self.emit(&request.config, &request.infra, OperationEventType::Start, Err(&err), false)
                    .await;
                return Err(err);
            }
        };

        match self.start(&request, engine).await {
            Ok(response) => {
                info!(
                    container = %response.container_name,
                    "Gitspace container is running"
                );
                self.emit(
                    &request.config,
                    &request.infra,
                    OperationEventType::Start,
                    Ok(Some(response)),
                    false,
                )
                .await;
                Ok(())
            }
            Err(err) => {
                warn!(gitspace = %request.config.identifier, "Failed to start gitspace: {}", err);
                self.emit(&request.config, &request.infra, OperationEventType::Start, Err(&err), false)
                    .await;
                Err(err)
            }
        }
    }

    async fn stop_gitspace(&self, config: &GitspaceConfig, infra: &Infrastructure) -> Result<()> {
        let name = container_name(config);
        let logger = Self::logger(config);
        let engine = self.engines.engine(infra)?;

        let result: Result<()> = async {
            match container_state(engine.as_ref(), &name).await? {
                ContainerState::Removed => Err(Error::ContainerNotFound(name.clone())),
                ContainerState::Stopped => {
                    logger.debug("Gitspace is already stopped");
                    Ok(())
                }
                ContainerState::Running => {
                    engine.ping().await?;
                    engine
                        .stop_container(&name)
                        .await
                        .map_err(|e| log_and_wrap(&logger, "Error while stopping container", e))?;
                    logger.info("Successfully stopped container");
                    Ok(())
                }
                other => Err(Error::UnhandledContainerState {
                    container: name.clone(),
                    state: other.to_string(),
                }),
            }
        }
        .await;

        self.emit(config, infra, OperationEventType::Stop, result.as_ref().map(|_| None), false)
            .await;
        result
    }

    async fn stop_and_remove_gitspace(
        &self,
        config: &GitspaceConfig,
        infra: &Infrastructure,
        can_delete_user_data: bool,
    ) -> Result<()> {
        let name = container_name(config);
        let logger = Self::logger(config);
        let engine = self.engines.engine(infra)?;

        let result: Result<()> = async {
            let state = container_state(engine.as_ref(), &name).await?;
            if state == ContainerState::Removed {
                logger.debug("Gitspace is already removed");
                return Ok(());
            }
            if state != ContainerState::Stopped {
                engine
                    .stop_container(&name)
                    .await
                    .map_err(|e| e.context(format!("failed to stop gitspace {}", name)))?;
                logger.info("Successfully stopped container");
            }
            engine
                .remove_container(&name, true)
                .await
                .map_err(|e| e.context(format!("failed to remove gitspace {}", name)))?;
            logger.info("Successfully removed container");
            Ok(())
        }
        .await;

        self.emit(
            config,
            infra,
            OperationEventType::Delete,
            result.as_ref().map(|_| None),
            can_delete_user_data,
        )
        .await;
        result
    }

    async fn status(&self, infra: &Infrastructure) -> Result<()> {
        let engine = self.engines.engine(infra)?;
        engine.ping().await
    }
}
