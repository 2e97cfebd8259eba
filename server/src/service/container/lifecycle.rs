//! Lifecycle hooks from features and devcontainer.json

use std::collections::HashMap;

use crate::domain::container::{LifecycleHookStep, LifecycleHooks, PostAction, LIFECYCLE_HOOKS_LABEL};
use crate::domain::devcontainer::{DevcontainerConfig, LifecycleCommand};
use crate::domain::feature::ResolvedFeature;
use crate::error::{Error, Result};

/// Source name of hooks declared by devcontainer.json
pub const DEVCONTAINER_SOURCE: &str = "devcontainer.json";

/// Merge the post-create and post-start hooks of `features` and `devcontainer`.
///
/// Feature hooks come first, in install order, and stop the setup when
/// they fail. Hooks from devcontainer.json run last and only log failures.
pub fn merge_lifecycle_hooks(
    devcontainer: &DevcontainerConfig,
    features: &[ResolvedFeature],
) -> LifecycleHooks {
    let mut post_create = Vec::new();
    let mut post_start = Vec::new();

    for feature in features {
        let downloaded = &feature.downloaded_feature;
        let config = &downloaded.devcontainer_feature_config;
        if !config.post_create_command.is_empty() {
            post_create.push(hook(&downloaded.source, &config.post_create_command, PostAction::PostCreate, true));
        }
        if !config.post_start_command.is_empty() {
            post_start.push(hook(&downloaded.source, &config.post_start_command, PostAction::PostStart, true));
        }
    }

    if !devcontainer.post_create_command.is_empty() {
        post_create.push(hook(
            DEVCONTAINER_SOURCE,
            &devcontainer.post_create_command,
            PostAction::PostCreate,
            false,
        ));
    }
    if !devcontainer.post_start_command.is_empty() {
        post_start.push(hook(
            DEVCONTAINER_SOURCE,
            &devcontainer.post_start_command,
            PostAction::PostStart,
            false,
        ));
    }

    HashMap::from([
        (PostAction::PostCreate, post_create),
        (PostAction::PostStart, post_start),
    ])
}

fn hook(source: &str, command: &LifecycleCommand, action_type: PostAction, stop_on_failure: bool) -> LifecycleHookStep {
    LifecycleHookStep {
        source: source.to_string(),
        command: command.clone(),
        action_type,
        stop_on_failure,
    }
}

/// Hooks recorded in the container labels, if any
pub fn hooks_from_labels(labels: &HashMap<String, String>) -> Result<Option<LifecycleHooks>> {
    labels
        .get(LIFECYCLE_HOOKS_LABEL)
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            serde_json::from_str(raw).map_err(|e| {
                Error::from(e).context("could not extract lifecycle hooks")
            })
        })
        .transpose()
}
