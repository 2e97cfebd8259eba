//! Feature option resolution

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::devcontainer::{FeatureValue, Features};
use crate::domain::feature::{DownloadedFeature, FeatureOptionValue, ResolvedFeature};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct DigestInput<'a> {
    source: &'a str,
    options: &'a BTreeMap<String, FeatureOptionValue>,
}

/// sha256 over a feature source and its option overrides.
///
/// Options are keyed by a sorted map, so the digest does not depend on the
/// order they were declared in.
pub fn calculate_digest(
    source: &str,
    options: &BTreeMap<String, FeatureOptionValue>,
) -> Result<String> {
    let encoded = serde_json::to_vec(&DigestInput { source, options })?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}

/// Resolve the options of every user feature and of their transitive dependencies.
///
/// Features with the same source and options collapse into one entry keyed
/// by digest.
pub fn resolve_features(
    user_features: &Features,
    downloaded: &HashMap<String, Arc<DownloadedFeature>>,
) -> Result<HashMap<String, ResolvedFeature>> {
    let mut worklist: VecDeque<(String, FeatureValue)> = user_features
        .iter()
        .map(|(source, value)| (source.clone(), value.clone()))
        .collect();
    let mut resolved: HashMap<String, ResolvedFeature> = HashMap::new();

    while let Some((source, value)) = worklist.pop_front() {
        let override_options = value.options();
        let digest = calculate_digest(&source, &override_options)?;
        if resolved.contains_key(&digest) {
            continue;
        }

        let feature = downloaded.get(&source).ok_or_else(|| {
            Error::FeatureResolution(format!("feature {} has not been downloaded", source))
        })?;

        let mut resolved_options = BTreeMap::new();
        for (name, option) in &feature.devcontainer_feature_config.options {
            let value = match override_options.get(name) {
                Some(user_value) => {
                    option
                        .validate_value(user_value)
                        .map_err(|reason| Error::InvalidFeatureOption {
                            feature: source.clone(),
                            option: name.clone(),
                            reason,
                        })?
                }
                None => option.default_value(),
            };
            resolved_options.insert(name.clone(), value);
        }

        for (dependency, dependency_value) in &feature.devcontainer_feature_config.depends_on {
            worklist.push_back((dependency.clone(), dependency_value.clone()));
        }

        resolved.insert(
            digest.clone(),
            ResolvedFeature {
                resolved_options,
                override_options,
                digest,
                downloaded_feature: feature.clone(),
            },
        );
    }

    Ok(resolved)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::feature::DevcontainerFeatureConfig;

    /// A downloaded feature with the given manifest, keyed by its source
    pub fn downloaded(source: &str, manifest: &str) -> (String, Arc<DownloadedFeature>) {
        let (source_without_tag, tag) = crate::domain::feature::split_oci_source(source);
        let config = DevcontainerFeatureConfig::from_jsonc(manifest).unwrap();
        let folder = source_without_tag.rsplit('/').next().unwrap().to_string();
        (
            source.to_string(),
            Arc::new(DownloadedFeature {
                feature_folder_name: format!("devcontainer-feature-{}", folder),
                source: source.to_string(),
                source_without_tag,
                tag,
                canonical_name: format!("sha256:{}", folder),
                directory: format!("/tmp/features/{}", folder),
                devcontainer_feature_config: config,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::downloaded;
    use super::*;

    const NODE: &str = "ghcr.io/devcontainers/features/node:1";
    const COMMON: &str = "ghcr.io/devcontainers/features/common-utils:2";

    fn node_manifest() -> String {
        format!(
            r#"{{
                "id": "node",
                "options": {{
                    "version": {{ "type": "string", "default": "lts", "enum": ["lts", "20", "22"] }},
                    "installYarn": {{ "type": "boolean", "default": true }}
                }},
                "dependsOn": {{ "{}": {{ "installZsh": false }} }}
            }}"#,
            COMMON
        )
    }

    fn common_manifest() -> &'static str {
        r#"{ "id": "common-utils", "options": { "installZsh": { "type": "boolean", "default": true } } }"#
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = BTreeMap::from([
            ("a".to_string(), FeatureOptionValue::Bool(true)),
            ("b".to_string(), FeatureOptionValue::String("x".to_string())),
        ]);
        let mut b = BTreeMap::new();
        b.insert("b".to_string(), FeatureOptionValue::String("x".to_string()));
        b.insert("a".to_string(), FeatureOptionValue::Bool(true));

        assert_eq!(
            calculate_digest(NODE, &a).unwrap(),
            calculate_digest(NODE, &b).unwrap()
        );
        assert_ne!(
            calculate_digest(NODE, &a).unwrap(),
            calculate_digest(COMMON, &a).unwrap()
        );
    }

    #[test]
    fn test_resolves_defaults_overrides_and_dependencies() {
        let downloaded: HashMap<_, _> =
            [downloaded(NODE, &node_manifest()), downloaded(COMMON, common_manifest())]
                .into_iter()
                .collect();
        let user = Features::from([(
            NODE.to_string(),
            FeatureValue::Options(BTreeMap::from([(
                "version".to_string(),
                FeatureOptionValue::String("20".to_string()),
            )])),
        )]);

        let resolved = resolve_features(&user, &downloaded).unwrap();
        assert_eq!(resolved.len(), 2);

        let node = resolved
            .values()
            .find(|f| f.downloaded_feature.source == NODE)
            .unwrap();
        assert_eq!(node.resolved_options["version"], "20");
        assert_eq!(node.resolved_options["installYarn"], "true");

        let common = resolved
            .values()
            .find(|f| f.downloaded_feature.source == COMMON)
            .unwrap();
        assert_eq!(common.resolved_options["installZsh"], "false");
    }

    #[test]
    fn test_identical_features_collapse() {
        let downloaded: HashMap<_, _> =
            [downloaded(NODE, &node_manifest()), downloaded(COMMON, common_manifest())]
                .into_iter()
                .collect();

        // common-utils is declared by the user and reached through node with the same options
        let user = Features::from([
            (NODE.to_string(), FeatureValue::Enabled(true)),
            (
                COMMON.to_string(),
                FeatureValue::Options(BTreeMap::from([(
                    "installZsh".to_string(),
                    FeatureOptionValue::Bool(false),
                )])),
            ),
        ]);
        let resolved = resolve_features(&user, &downloaded).unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_invalid_option_fails() {
        let downloaded: HashMap<_, _> =
            [downloaded(NODE, &node_manifest()), downloaded(COMMON, common_manifest())]
                .into_iter()
                .collect();
        let user = Features::from([(
            NODE.to_string(),
            FeatureValue::Options(BTreeMap::from([(
                "version".to_string(),
                FeatureOptionValue::String("8".to_string()),
            )])),
        )]);

        assert!(matches!(
            resolve_features(&user, &downloaded),
            Err(Error::InvalidFeatureOption { .. })
        ));
    }

    #[test]
    fn test_missing_download_fails() {
        let user = Features::from([(NODE.to_string(), FeatureValue::Enabled(true))]);
        assert!(matches!(
            resolve_features(&user, &HashMap::new()),
            Err(Error::FeatureResolution(_))
        ));
    }
}
