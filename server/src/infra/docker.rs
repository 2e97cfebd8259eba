//! Docker management layer

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::{
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::{BuildImageOptions, CreateImageOptions},
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::domain::container::{ContainerSummary, ExecOutput, ImageData};
use crate::domain::infra::Infrastructure;
use crate::error::{Error, Result};

/// Label carrying devcontainer metadata baked into an image
pub const DEVCONTAINER_METADATA_LABEL: &str = "devcontainer.metadata";

/// Credentials for pulling from a private registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

/// A command to run inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub user: String,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    /// Return right after the exec started
    pub detach: bool,
}

/// What the orchestrator needs from an inspected container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// `<port>/tcp` to the host port it is published on
    pub port_bindings: HashMap<String, String>,
}

/// Container engine operations used by the gitspace orchestrators
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Check if the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// Containers whose name matches the filter, including stopped ones
    async fn list_containers_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `image`, logging per-layer progress
    async fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<()>;

    async fn inspect_image(&self, image: &str) -> Result<ImageData>;

    /// Build an image tagged `tag` from a tar build context
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()>;

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<String>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<()>;

    async fn exec(&self, container: &str, request: ExecRequest) -> Result<ExecOutput>;

    /// Extract a tar archive into `path` inside the container
    async fn copy_to_container(&self, container: &str, path: &str, archive: Vec<u8>) -> Result<()>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// Builds an engine client for a provisioned infrastructure
#[cfg_attr(test, mockall::automock)]
pub trait ContainerEngineFactory: Send + Sync {
    fn engine(&self, infra: &Infrastructure) -> Result<Arc<dyn ContainerEngine>>;
}

/// Split an image reference into name and tag, defaulting the tag to `latest`
pub fn image_and_tag(image: &str) -> (String, String) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(idx) => (
            image[..name_start + idx].to_string(),
            image[name_start + idx + 1..].to_string(),
        ),
        None => (image.to_string(), "latest".to_string()),
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Docker engine backed by bollard
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    /// Connect to the Docker daemon
    pub fn new(socket_path: Option<&str>) -> Result<Self> {
        let client = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| Error::DockerError(e.to_string()))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| Error::DockerError(e.to_string()))?,
        };

        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| Error::InfraUnreachable(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }

    async fn list_containers_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::DockerError(format!("Failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                names: c.names.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerDetails> {
        let info = self.client.inspect_container(name, None).await.map_err(|e| {
            if is_not_found(&e) {
                Error::ContainerNotFound(name.to_string())
            } else {
                Error::DockerError(format!("Failed to inspect container {}: {}", name, e))
            }
        })?;

        let labels = info
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        let port_bindings = info
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(port, bindings)| {
                let host_port = bindings?.into_iter().find_map(|b| b.host_port)?;
                Some((port, host_port))
            })
            .collect();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            labels,
            port_bindings,
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::DockerError(format!(
                "Failed to inspect image {}: {}",
                image, e
            ))),
        }
    }

    async fn pull_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<()> {
        let (from_image, tag) = image_and_tag(image);
        info!("Pulling image {}:{}", from_image, tag);

        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username),
            password: Some(a.password),
            serveraddress: Some(a.server_address),
            ..Default::default()
        });

        let mut stream = self.client.create_image(Some(options), None, credentials);
        let mut layer_status: HashMap<String, String> = HashMap::new();

        while let Some(result) = stream.next().await {
            let progress =
                result.map_err(|e| Error::DockerError(format!("Failed to pull image: {}", e)))?;

            if let Some(error) = progress.error {
                return Err(Error::DockerError(format!(
                    "Failed to pull image {}: {}",
                    image, error
                )));
            }

            let (Some(id), Some(status)) = (progress.id, progress.status) else {
                continue;
            };
            if layer_status.get(&id) != Some(&status) {
                debug!(image = %image, layer = %id, "Pull status: {}", status);
                layer_status.insert(id, status);
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageData> {
        let inspect = self
            .client
            .inspect_image(image)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to inspect image {}: {}", image, e)))?;

        let config = inspect.config.unwrap_or_default();
        let user = config
            .user
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "root".to_string());
        let metadata = config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(DEVCONTAINER_METADATA_LABEL))
            .map(|raw| parse_image_metadata(raw))
            .transpose()?
            .unwrap_or_default();

        Ok(ImageData {
            user,
            metadata,
            os: inspect.os.unwrap_or_default(),
            arch: inspect.architecture.unwrap_or_default(),
        })
    }

    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()> {
        let options = BuildImageOptions {
            t: tag.to_string(),
            dockerfile: "Dockerfile".to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(bytes::Bytes::from(context)));

        while let Some(result) = stream.next().await {
            let info =
                result.map_err(|e| Error::DockerError(format!("Failed to build image: {}", e)))?;
            if let Some(error) = info.error {
                return Err(Error::DockerError(format!(
                    "Failed to build image {}: {}",
                    tag, error
                )));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %tag, "{}", line);
                }
            }
        }

        info!("Image {} built", tag);
        Ok(())
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create container: {}", e)))?;

        for warning in &response.warnings {
            warn!(container = %name, "Create warning: {}", warning);
        }

        info!("Container {} created with ID: {}", name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to start container: {}", e)))?;

        info!("Container {} started", name);
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let options = StopContainerOptions { t: 10 };

        self.client
            .stop_container(name, Some(options))
            .await
            .map_err(|e| Error::DockerError(format!("Failed to stop container: {}", e)))?;

        info!("Container {} stopped", name);
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => {
                info!("Container {} removed", name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!("Container {} already removed", name);
                Ok(())
            }
            Err(e) => Err(Error::DockerError(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }

    async fn exec(&self, container: &str, request: ExecRequest) -> Result<ExecOutput> {
        let options = CreateExecOptions {
            cmd: Some(request.cmd),
            user: Some(request.user),
            working_dir: request.working_dir,
            env: if request.env.is_empty() {
                None
            } else {
                Some(request.env)
            },
            attach_stdout: Some(!request.detach),
            attach_stderr: Some(!request.detach),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container, options)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create exec: {}", e)))?;

        let started = self
            .client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: request.detach,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::DockerError(format!("Failed to start exec: {}", e)))?;

        let mut output = ExecOutput::default();
        match started {
            StartExecResults::Detached => return Ok(output),
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    match chunk
                        .map_err(|e| Error::DockerError(format!("Failed to read exec output: {}", e)))?
                    {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            output.stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdErr { message } => {
                            output.stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to inspect exec: {}", e)))?;
        output.exit_code = inspect.exit_code.unwrap_or_default();

        Ok(output)
    }

    async fn copy_to_container(&self, container: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container, Some(options), bytes::Bytes::from(archive))
            .await
            .map_err(|e| Error::DockerError(format!("Failed to copy to container: {}", e)))?;

        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };

        self.client
            .create_volume(options)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create volume {}: {}", name, e)))?;

        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        match self
            .client
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::DockerError(format!(
                "Failed to remove volume {}: {}",
                name, e
            ))),
        }
    }
}

/// Parse the `devcontainer.metadata` label, an array of objects or a single object
pub fn parse_image_metadata(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| Error::DockerError(format!("invalid {} label: {}", DEVCONTAINER_METADATA_LABEL, e)))?;

    let mut merged = serde_json::Map::new();
    let entries = match value {
        serde_json::Value::Array(entries) => entries,
        object @ serde_json::Value::Object(_) => vec![object],
        _ => Vec::new(),
    };
    for entry in entries {
        if let serde_json::Value::Object(fields) = entry {
            // Later entries override earlier ones
            merged.extend(fields);
        }
    }

    Ok(merged)
}

/// Creates one Docker client per operation
pub struct DockerEngineFactory {
    socket_path: Option<String>,
}

impl DockerEngineFactory {
    pub fn new(socket_path: Option<String>) -> Self {
        Self { socket_path }
    }
}

impl ContainerEngineFactory for DockerEngineFactory {
    fn engine(&self, _infra: &Infrastructure) -> Result<Arc<dyn ContainerEngine>> {
        Ok(Arc::new(DockerEngine::new(self.socket_path.as_deref())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_and_tag() {
        assert_eq!(
            image_and_tag("mcr.microsoft.com/devcontainers/base:dev-ubuntu-24.04"),
            (
                "mcr.microsoft.com/devcontainers/base".to_string(),
                "dev-ubuntu-24.04".to_string()
            )
        );
        assert_eq!(
            image_and_tag("ubuntu"),
            ("ubuntu".to_string(), "latest".to_string())
        );
        assert_eq!(
            image_and_tag("localhost:5000/team/app"),
            ("localhost:5000/team/app".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_parse_image_metadata_merges_entries() {
        let raw = r#"[{"remoteUser":"vscode","containerEnv":{"A":"1"}},{"remoteUser":"dev"}]"#;
        let metadata = parse_image_metadata(raw).unwrap();
        assert_eq!(metadata.get("remoteUser").and_then(|v| v.as_str()), Some("dev"));
        assert!(metadata.contains_key("containerEnv"));

        let single = parse_image_metadata(r#"{"containerUser":"node"}"#).unwrap();
        assert_eq!(
            single.get("containerUser").and_then(|v| v.as_str()),
            Some("node")
        );
        assert!(parse_image_metadata("not json").is_err());
    }
}
