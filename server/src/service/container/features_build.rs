//! Derived image with the devcontainer features installed

use std::path::PathBuf;

use serde::Serialize;

use super::image::ContainerUsers;
use crate::domain::container::user_home_dir;
use crate::domain::feature::ResolvedFeature;
use crate::error::{Error, Result};
use crate::infra::docker::ContainerEngine;
use crate::infra::template::{shell_quote, ScriptTemplates, TEMPLATE_FEATURES_DOCKERFILE};
use crate::service::logger::{log_and_wrap, GitspaceLogger};

#[derive(Debug, Serialize)]
struct FeatureStage {
    folder: String,
    env: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DockerfilePayload<'a> {
    base_image: &'a str,
    container_user: &'a str,
    features: &'a [FeatureStage],
}

/// Tag of the image built for an instance
pub fn features_image_tag(instance_identifier: &str) -> String {
    format!("gitspace-with-features-{}", instance_identifier).to_lowercase()
}

/// Option name as an environment variable, e.g. `install-yarn` -> `INSTALL_YARN`
pub fn option_env_name(option: &str) -> String {
    option
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn feature_stages(features: &[ResolvedFeature], users: &ContainerUsers) -> Vec<FeatureStage> {
    features
        .iter()
        .enumerate()
        .map(|(index, feature)| {
            let mut env: Vec<String> = feature
                .resolved_options
                .iter()
                .map(|(name, value)| format!("{}={}", option_env_name(name), shell_quote(value)))
                .collect();
            env.push(format!("_REMOTE_USER={}", shell_quote(&users.remote_user)));
            env.push(format!("_REMOTE_USER_HOME={}", shell_quote(&user_home_dir(&users.remote_user))));
            env.push(format!("_CONTAINER_USER={}", shell_quote(&users.container_user)));
            env.push(format!(
                "_CONTAINER_USER_HOME={}",
                shell_quote(&user_home_dir(&users.container_user))
            ));
            FeatureStage {
                folder: format!("{}-{}", feature.downloaded_feature.feature_folder_name, index),
                env,
            }
        })
        .collect()
}

/// Render the Dockerfile installing `features` on top of `base_image`
pub fn features_dockerfile(
    templates: &ScriptTemplates,
    base_image: &str,
    features: &[ResolvedFeature],
    users: &ContainerUsers,
) -> Result<String> {
    let stages = feature_stages(features, users);
    templates.generate_script(
        TEMPLATE_FEATURES_DOCKERFILE,
        &DockerfilePayload {
            base_image,
            container_user: &users.container_user,
            features: &stages,
        },
    )
}

fn build_context(dockerfile: String, features: Vec<(String, PathBuf)>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

    for (folder, directory) in features {
        builder
            .append_dir_all(&folder, &directory)
            .map_err(|e| Error::Internal(format!("failed to pack feature {}: {}", folder, e)))?;
    }
    Ok(builder.into_inner()?)
}

/// Build the derived image and return its tag
pub async fn build_features_image(
    engine: &dyn ContainerEngine,
    templates: &ScriptTemplates,
    instance_identifier: &str,
    base_image: &str,
    features: &[ResolvedFeature],
    users: &ContainerUsers,
    logger: &dyn GitspaceLogger,
) -> Result<String> {
    let tag = features_image_tag(instance_identifier);
    logger.info(&format!("Building image {} with {} features", tag, features.len()));

    let dockerfile = features_dockerfile(templates, base_image, features, users)
        .map_err(|e| log_and_wrap(logger, "Error generating features Dockerfile", e))?;
    logger.debug(&format!("Features Dockerfile:\n{}", dockerfile));

    let sources: Vec<(String, PathBuf)> = features
        .iter()
        .enumerate()
        .map(|(index, feature)| {
            (
                format!("{}-{}", feature.downloaded_feature.feature_folder_name, index),
                PathBuf::from(&feature.downloaded_feature.directory),
            )
        })
        .collect();
    let context = tokio::task::spawn_blocking(move || build_context(dockerfile, sources))
        .await?
        .map_err(|e| log_and_wrap(logger, "Error packing features build context", e))?;

    engine
        .build_image(&tag, context)
        .await
        .map_err(|e| log_and_wrap(logger, "Error building features image", e))?;

    logger.info(&format!("Image {} built", tag));
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::infra::docker::MockContainerEngine;
    use crate::service::feature::resolve::testing::downloaded;
    use crate::service::logger::testing::RecordingLogger;

    fn users() -> ContainerUsers {
        ContainerUsers {
            container_user: "root".to_string(),
            remote_user: "vscode".to_string(),
        }
    }

    fn node_feature(directory: &str) -> ResolvedFeature {
        let (_, downloaded) = downloaded(
            "ghcr.io/devcontainers/features/node:1",
            r#"{ "id": "node" }"#,
        );
        let mut downloaded = (*downloaded).clone();
        downloaded.directory = directory.to_string();
        ResolvedFeature {
            resolved_options: [
                ("version".to_string(), "20".to_string()),
                ("install-yarn".to_string(), "true".to_string()),
            ]
            .into_iter()
            .collect(),
            override_options: Default::default(),
            digest: "node".to_string(),
            downloaded_feature: std::sync::Arc::new(downloaded),
        }
    }

    #[test]
    fn test_option_env_name() {
        assert_eq!(option_env_name("installYarn"), "INSTALLYARN");
        assert_eq!(option_env_name("install-yarn.v2"), "INSTALL_YARN_V2");
    }

    #[test]
    fn test_dockerfile_stages_features_in_order() {
        let templates = ScriptTemplates::new().unwrap();
        let dockerfile = features_dockerfile(
            &templates,
            "ubuntu:24.04",
            &[node_feature("/tmp/node")],
            &users(),
        )
        .unwrap();

        assert!(dockerfile.starts_with("FROM ubuntu:24.04"));
        assert!(dockerfile.contains("/tmp/build-features/devcontainer-feature-node-0"));
        assert!(dockerfile.contains("export INSTALL_YARN='true'"));
        assert!(dockerfile.contains("export VERSION='20'"));
        assert!(dockerfile.contains("export _REMOTE_USER='vscode'"));
        assert!(dockerfile.contains("USER root"));
    }

    #[tokio::test]
    async fn test_build_sends_context_with_feature_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("install.sh"), "#!/bin/sh\necho node").unwrap();
        let feature = node_feature(dir.path().to_str().unwrap());

        let mut engine = MockContainerEngine::new();
        engine
            .expect_build_image()
            .withf(|tag, context| {
                let mut archive = tar::Archive::new(context.as_slice());
                let names: Vec<String> = archive
                    .entries()
                    .unwrap()
                    .filter_map(|e| e.ok())
                    .map(|e| e.path().unwrap().to_string_lossy().to_string())
                    .collect();
                tag == "gitspace-with-features-gs-abc"
                    && names.contains(&"Dockerfile".to_string())
                    && names.contains(&"devcontainer-feature-node-0/install.sh".to_string())
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let templates = ScriptTemplates::new().unwrap();
        let logger = RecordingLogger::default();
        let tag = build_features_image(
            &engine,
            &templates,
            "GS-abc",
            "ubuntu:24.04",
            &[feature],
            &users(),
            &logger,
        )
        .await
        .unwrap();
        assert_eq!(tag, "gitspace-with-features-gs-abc");
    }

    #[test]
    fn test_context_dockerfile_entry() {
        let dir = tempfile::tempdir().unwrap();
        let context = build_context(
            "FROM scratch".to_string(),
            vec![("f-0".to_string(), dir.path().to_path_buf())],
        )
        .unwrap();
        let mut archive = tar::Archive::new(context.as_slice());
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "FROM scratch");
    }
}
