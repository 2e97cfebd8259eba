//! Container create configuration

use std::collections::{BTreeMap, HashMap};

use bollard::container::Config;
use bollard::models::{HostConfig, Mount as EngineMount, MountTypeEnum, PortBinding};

use super::image::{ContainerUsers, ImageMetadata};
use super::lifecycle::merge_lifecycle_hooks;
use super::run_args::RunArgs;
use crate::domain::container::{LifecycleHooks, LIFECYCLE_HOOKS_LABEL, REMOTE_USER_LABEL};
use crate::domain::devcontainer::{DevcontainerConfig, Mount};
use crate::domain::feature::ResolvedFeature;
use crate::domain::infra::PortMapping;
use crate::domain::run_arg::RunArg;
use crate::error::{Error, Result};

/// Keeps the container alive and exits cleanly on SIGTERM
pub const KEEP_ALIVE_COMMAND: &str = "trap 'exit 0' 15; sleep infinity & wait $!";

const CATCH_ALL_IP: &str = "0.0.0.0";

/// Everything that shapes a new gitspace container
pub struct ContainerBlueprint<'a> {
    pub image: &'a str,
    /// Named volume mounted at the remote user's home
    pub storage: &'a str,
    pub home_dir: &'a str,
    pub port_mappings: &'a HashMap<u16, PortMapping>,
    pub run_args: &'a RunArgs,
    pub users: &'a ContainerUsers,
    /// Features in install order
    pub features: &'a [ResolvedFeature],
    pub devcontainer: &'a DevcontainerConfig,
    pub metadata: &'a ImageMetadata,
}

impl ContainerBlueprint<'_> {
    /// Container env: image metadata, features, devcontainer.json, then `--env`
    pub fn env(&self) -> Vec<String> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.extend(self.metadata.container_env.clone());
        for feature in self.features {
            env.extend(
                feature
                    .downloaded_feature
                    .devcontainer_feature_config
                    .container_env
                    .clone(),
            );
        }
        env.extend(self.devcontainer.container_env.clone());
        for raw in self.run_args.env() {
            let (key, value) = raw.split_once('=').unwrap_or((raw.as_str(), ""));
            env.insert(key.to_string(), value.to_string());
        }
        env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Lifecycle hooks, with image metadata standing in for missing devcontainer.json commands
    pub fn lifecycle_hooks(&self) -> LifecycleHooks {
        let mut devcontainer = self.devcontainer.clone();
        if devcontainer.post_create_command.is_empty() {
            devcontainer.post_create_command = self.metadata.post_create_command.clone();
        }
        if devcontainer.post_start_command.is_empty() {
            devcontainer.post_start_command = self.metadata.post_start_command.clone();
        }
        merge_lifecycle_hooks(&devcontainer, self.features)
    }

    /// Feature mounts, then the first non-empty of run args, devcontainer.json
    /// and image metadata, then the home volume
    pub fn mounts(&self) -> Result<Vec<EngineMount>> {
        let mut raw: Vec<Mount> = self
            .features
            .iter()
            .flat_map(|f| f.downloaded_feature.devcontainer_feature_config.mounts.clone())
            .collect();

        let from_run_args = self
            .run_args
            .mounts()
            .map_err(|e| e.context("failed to merge mounts"))?;
        if !from_run_args.is_empty() {
            raw.extend(from_run_args);
        } else if !self.devcontainer.mounts.is_empty() {
            raw.extend(self.devcontainer.mounts.clone());
        } else {
            raw.extend(self.metadata.mounts.clone());
        }

        let mut mounts: Vec<EngineMount> = raw.iter().map(engine_mount).collect();
        mounts.push(EngineMount {
            typ: Some(MountTypeEnum::VOLUME),
            source: Some(self.storage.to_string()),
            target: Some(self.home_dir.to_string()),
            ..Default::default()
        });
        Ok(mounts)
    }

    fn merged_list(
        &self,
        arg: RunArg,
        from_devcontainer: &[String],
        from_metadata: &[String],
        from_feature: fn(&ResolvedFeature) -> &Vec<String>,
    ) -> Vec<String> {
        let mut values: Vec<String> = self
            .features
            .iter()
            .flat_map(|f| from_feature(f).iter().cloned())
            .collect();

        let from_run_args = self.run_args.strings(arg);
        if !from_run_args.is_empty() {
            values.extend(from_run_args);
        } else if !from_devcontainer.is_empty() {
            values.extend(from_devcontainer.iter().cloned());
        } else {
            values.extend(from_metadata.iter().cloned());
        }
        values
    }

    pub fn cap_add(&self) -> Vec<String> {
        self.merged_list(
            RunArg::CapAdd,
            &self.devcontainer.cap_add,
            &self.metadata.cap_add,
            |f| &f.downloaded_feature.devcontainer_feature_config.cap_add,
        )
    }

    pub fn security_opt(&self) -> Vec<String> {
        self.merged_list(
            RunArg::SecurityOpt,
            &self.devcontainer.security_opt,
            &self.metadata.security_opt,
            |f| &f.downloaded_feature.devcontainer_feature_config.security_opt,
        )
    }

    pub fn init(&self) -> bool {
        let declared = self
            .run_args
            .bool_flag(RunArg::Init)
            .or(self.devcontainer.init)
            .or(self.metadata.init)
            .unwrap_or(false);
        declared
            || self
                .features
                .iter()
                .any(|f| f.downloaded_feature.devcontainer_feature_config.init)
    }

    pub fn privileged(&self) -> bool {
        let declared = self
            .run_args
            .bool_flag(RunArg::Privileged)
            .or(self.devcontainer.privileged)
            .or(self.metadata.privileged)
            .unwrap_or(false);
        declared
            || self
                .features
                .iter()
                .any(|f| f.downloaded_feature.devcontainer_feature_config.privileged)
    }

    /// Entrypoint and command.
    ///
    /// Feature entrypoints run ahead of the keep-alive command. An
    /// `--entrypoint` run arg replaces the keep-alive command.
    pub fn entrypoint_and_cmd(&self) -> (Vec<String>, Option<Vec<String>>) {
        let mut entrypoint: Vec<String> = self
            .features
            .iter()
            .filter_map(|f| f.downloaded_feature.devcontainer_feature_config.entrypoint.clone())
            .filter(|e| !e.is_empty())
            .collect();
        let from_run_args = self.run_args.entrypoint();
        let keep_alive = from_run_args.is_empty();
        entrypoint.extend(from_run_args);

        if entrypoint.is_empty() {
            return (
                vec!["/bin/sh".to_string()],
                Some(vec!["-c".to_string(), KEEP_ALIVE_COMMAND.to_string()]),
            );
        }
        let cmd = keep_alive.then(|| {
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                KEEP_ALIVE_COMMAND.to_string(),
            ]
        });
        (entrypoint, cmd)
    }

    pub fn host_config(&self) -> Result<HostConfig> {
        let mut host = HostConfig {
            port_bindings: Some(port_bindings(self.port_mappings)),
            mounts: Some(self.mounts()?),
            cap_add: Some(self.cap_add()).filter(|c| !c.is_empty()),
            security_opt: Some(self.security_opt()).filter(|s| !s.is_empty()),
            init: Some(self.init()),
            privileged: Some(self.privileged()),
            ..Default::default()
        };
        self.run_args.apply_to_host_config(&mut host)?;
        Ok(host)
    }

    /// Create config for the container together with the hooks recorded in its labels
    pub fn build(&self) -> Result<(Config<String>, LifecycleHooks)> {
        let host_config = self.host_config()?;
        let healthcheck = self.run_args.health_check()?;
        let stop_timeout = self.run_args.stop_timeout()?;
        let (entrypoint, cmd) = self.entrypoint_and_cmd();

        let hooks = self.lifecycle_hooks();
        let encoded_hooks = serde_json::to_string(&hooks)
            .map_err(|e| Error::from(e).context("could not encode lifecycle hooks"))?;

        let mut labels = self.run_args.labels();
        labels.insert(REMOTE_USER_LABEL.to_string(), self.users.remote_user.clone());
        labels.insert(LIFECYCLE_HOOKS_LABEL.to_string(), encoded_hooks);

        let exposed_ports = self
            .port_mappings
            .keys()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();

        let config = Config {
            hostname: self.run_args.optional_string(RunArg::Hostname),
            domainname: self.run_args.optional_string(RunArg::Domainname),
            user: Some(self.users.container_user.clone()),
            image: Some(self.image.to_string()),
            env: Some(self.env()),
            entrypoint: Some(entrypoint),
            cmd,
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            healthcheck,
            mac_address: self.run_args.optional_string(RunArg::MacAddress),
            stop_signal: self.run_args.optional_string(RunArg::StopSignal),
            stop_timeout: stop_timeout.and_then(|t| t.try_into().ok()),
            host_config: Some(host_config),
            ..Default::default()
        };
        Ok((config, hooks))
    }
}

fn engine_mount(mount: &Mount) -> EngineMount {
    let typ = match mount.mount_type.as_str() {
        "bind" => MountTypeEnum::BIND,
        "tmpfs" => MountTypeEnum::TMPFS,
        "npipe" => MountTypeEnum::NPIPE,
        _ => MountTypeEnum::VOLUME,
    };
    EngineMount {
        typ: Some(typ),
        source: Some(mount.source.clone()).filter(|s| !s.is_empty()),
        target: Some(mount.target.clone()),
        ..Default::default()
    }
}

/// Bind every container port on all interfaces
pub fn port_bindings(
    mappings: &HashMap<u16, PortMapping>,
) -> HashMap<String, Option<Vec<PortBinding>>> {
    mappings
        .iter()
        .map(|(port, mapping)| {
            (
                format!("{}/tcp", port),
                Some(vec![PortBinding {
                    host_ip: Some(CATCH_ALL_IP.to_string()),
                    host_port: Some(mapping.published_port.to_string()),
                }]),
            )
        })
        .collect()
}
