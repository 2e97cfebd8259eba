//! Image pull and user resolution

use std::collections::HashMap;

use serde::Deserialize;

use super::run_args::{PullPolicy, RunArgs};
use crate::domain::container::ImageData;
use crate::domain::devcontainer::{deserialize_mounts, DevcontainerConfig, LifecycleCommand, Mount};
use crate::error::{Error, Result};
use crate::infra::connector::ConnectorDetails;
use crate::infra::docker::{ContainerEngine, RegistryAuth};
use crate::service::logger::GitspaceLogger;

/// Typed view of the `devcontainer.metadata` image label
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub container_user: Option<String>,
    #[serde(default)]
    pub container_env: HashMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_mounts")]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub init: Option<bool>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub post_create_command: LifecycleCommand,
    #[serde(default)]
    pub post_start_command: LifecycleCommand,
}

impl ImageMetadata {
    pub fn from_image(image: &ImageData) -> Result<Self> {
        serde_json::from_value(serde_json::Value::Object(image.metadata.clone()))
            .map_err(|e| Error::from(e).context("invalid devcontainer.metadata label"))
    }
}

/// Users a gitspace container runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerUsers {
    /// User the container process runs as
    pub container_user: String,
    /// User setup steps and the IDE run as
    pub remote_user: String,
}

/// Pick the effective users: run args, then devcontainer.json, then image
/// metadata, then the image user.
pub fn resolve_users(
    run_args: &RunArgs,
    devcontainer: &DevcontainerConfig,
    metadata: &ImageMetadata,
    image: &ImageData,
) -> ContainerUsers {
    let non_empty = |value: Option<&String>| value.filter(|v| !v.is_empty()).cloned();

    let container_user = run_args
        .user()
        .filter(|u| !u.is_empty())
        .or_else(|| non_empty(devcontainer.container_user.as_ref()))
        .or_else(|| non_empty(metadata.container_user.as_ref()))
        .unwrap_or_else(|| image.user.clone());

    let remote_user = non_empty(devcontainer.remote_user.as_ref())
        .or_else(|| non_empty(metadata.remote_user.as_ref()))
        .unwrap_or_else(|| container_user.clone());

    ContainerUsers {
        container_user,
        remote_user,
    }
}

/// Registry credentials for `image` from the resolved connectors
pub fn registry_auth(image: &str, connectors: &[ConnectorDetails]) -> Option<RegistryAuth> {
    connectors
        .iter()
        .find(|c| c.matches_image(image))
        .map(|c| RegistryAuth {
            username: c.username.clone(),
            password: c.password.clone(),
            server_address: c.url.clone(),
        })
}

/// Pull `image` according to `policy`
pub async fn pull_image(
    engine: &dyn ContainerEngine,
    image: &str,
    policy: PullPolicy,
    auth: Option<RegistryAuth>,
    logger: &dyn GitspaceLogger,
) -> Result<()> {
    match policy {
        PullPolicy::Never => {
            logger.info(&format!(
                "Image pull policy is set to 'never', skipping pull of {}",
                image
            ));
            if !engine.image_exists(image).await? {
                return Err(Error::ImageNotPresent(image.to_string()));
            }
            return Ok(());
        }
        PullPolicy::Missing => {
            if engine.image_exists(image).await? {
                logger.info(&format!("Image {} found locally, skipping pull", image));
                return Ok(());
            }
        }
        PullPolicy::Always => {}
    }

    logger.info(&format!("Pulling image {}", image));
    engine
        .pull_image(image, auth)
        .await
        .map_err(|e| e.context(format!("could not pull image {}", image)))?;
    logger.info(&format!("Image {} pulled", image));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run_arg::RunArg;
    use crate::infra::docker::MockContainerEngine;
    use crate::service::container::run_args::default_definitions;
    use crate::service::logger::testing::RecordingLogger;

    fn image_with(metadata: serde_json::Value, user: &str) -> ImageData {
        ImageData {
            user: user.to_string(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        }
    }

    fn args(tokens: &[&str]) -> RunArgs {
        let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        RunArgs::extract(&default_definitions(), &tokens).unwrap()
    }

    #[test]
    fn test_user_priority() {
        let image = image_with(
            serde_json::json!({ "remoteUser": "meta-remote", "containerUser": "meta-container" }),
            "image-user",
        );
        let metadata = ImageMetadata::from_image(&image).unwrap();
        let devcontainer = DevcontainerConfig {
            container_user: Some("dev-container".to_string()),
            ..Default::default()
        };

        let users = resolve_users(&args(&["--user", "arg-user"]), &devcontainer, &metadata, &image);
        assert_eq!(users.container_user, "arg-user");
        assert_eq!(users.remote_user, "meta-remote");

        let users = resolve_users(&args(&[]), &devcontainer, &metadata, &image);
        assert_eq!(users.container_user, "dev-container");

        let users = resolve_users(&args(&[]), &DevcontainerConfig::default(), &metadata, &image);
        assert_eq!(users.container_user, "meta-container");
    }

    #[test]
    fn test_users_fall_back_to_image_user() {
        let image = image_with(serde_json::json!({}), "root");
        let metadata = ImageMetadata::from_image(&image).unwrap();
        let users = resolve_users(&args(&[]), &DevcontainerConfig::default(), &metadata, &image);
        assert_eq!(users.container_user, "root");
        assert_eq!(users.remote_user, "root");
        assert!(args(&[]).get(RunArg::User).is_none());
    }

    #[test]
    fn test_metadata_fields() {
        let image = image_with(
            serde_json::json!({
                "containerEnv": { "PATH_EXTRA": "/opt/bin" },
                "mounts": ["source=cache,target=/cache,type=volume"],
                "capAdd": ["SYS_PTRACE"],
                "init": true,
                "postStartCommand": "echo started",
            }),
            "root",
        );
        let metadata = ImageMetadata::from_image(&image).unwrap();
        assert_eq!(metadata.container_env["PATH_EXTRA"], "/opt/bin");
        assert_eq!(metadata.mounts[0].target, "/cache");
        assert_eq!(metadata.cap_add, vec!["SYS_PTRACE"]);
        assert_eq!(metadata.init, Some(true));
        assert_eq!(metadata.post_start_command.to_command_array(), vec!["echo started"]);
    }

    #[test]
    fn test_registry_auth_matches_connector() {
        let connectors = vec![ConnectorDetails {
            id: "ghcr".to_string(),
            connector_type: "docker".to_string(),
            url: "https://ghcr.io/".to_string(),
            username: "bot".to_string(),
            password: "token".to_string(),
        }];
        let auth = registry_auth("ghcr.io/acme/dev:1", &connectors).unwrap();
        assert_eq!(auth.username, "bot");
        assert!(registry_auth("docker.io/library/ubuntu", &connectors).is_none());
    }

    #[tokio::test]
    async fn test_missing_policy_skips_present_image() {
        let mut engine = MockContainerEngine::new();
        engine.expect_image_exists().returning(|_| Ok(true));
        engine.expect_pull_image().never();

        let logger = RecordingLogger::default();
        pull_image(&engine, "ubuntu:24.04", PullPolicy::Missing, None, &logger)
            .await
            .unwrap();
        assert!(logger.contains("found locally"));
    }

    #[tokio::test]
    async fn test_always_policy_pulls() {
        let mut engine = MockContainerEngine::new();
        engine.expect_image_exists().never();
        engine
            .expect_pull_image()
            .withf(|image, auth| image == "ubuntu:24.04" && auth.is_none())
            .times(1)
            .returning(|_, _| Ok(()));

        let logger = RecordingLogger::default();
        pull_image(&engine, "ubuntu:24.04", PullPolicy::Always, None, &logger)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_policy_requires_local_image() {
        let mut engine = MockContainerEngine::new();
        engine.expect_image_exists().returning(|_| Ok(false));
        engine.expect_pull_image().never();

        let logger = RecordingLogger::default();
        let err = pull_image(&engine, "ubuntu:24.04", PullPolicy::Never, None, &logger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotPresent(_)));
    }
}
