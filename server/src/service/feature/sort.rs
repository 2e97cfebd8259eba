//! Feature install ordering

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::resolve::calculate_digest;
use crate::domain::feature::{source_without_tag, ResolvedFeature};
use crate::error::{Error, Result};

struct Node<'a> {
    feature: &'a ResolvedFeature,
    /// Digests that must be installed first
    dependencies: HashSet<String>,
    priority: usize,
}

fn compare(a: &ResolvedFeature, b: &ResolvedFeature) -> Ordering {
    let (fa, fb) = (&a.downloaded_feature, &b.downloaded_feature);
    fa.source_without_tag
        .cmp(&fb.source_without_tag)
        .then_with(|| fa.tag.cmp(&fb.tag))
        .then_with(|| a.resolved_options.len().cmp(&b.resolved_options.len()))
        .then_with(|| a.digest.cmp(&b.digest))
}

/// Order resolved features for installation.
///
/// `dependsOn` edges are hard, `installsAfter` edges only apply to features
/// present in the set. Within a round, features named earlier in
/// `override_order` are installed first.
pub fn sort_features(
    resolved: &HashMap<String, ResolvedFeature>,
    override_order: &[String],
) -> Result<Vec<ResolvedFeature>> {
    let mut digests_by_source: HashMap<String, Vec<String>> = HashMap::new();
    for feature in resolved.values() {
        digests_by_source
            .entry(feature.downloaded_feature.source_without_tag.clone())
            .or_default()
            .push(feature.digest.clone());
    }

    let override_sources: Vec<String> = override_order.iter().map(|s| source_without_tag(s)).collect();
    let matched = override_sources
        .iter()
        .filter(|s| digests_by_source.contains_key(s.as_str()))
        .count();
    if matched != override_sources.len() {
        return Err(Error::FeatureSort(format!(
            "overrideFeatureInstallOrder has {} entries but only {} match installed features",
            override_sources.len(),
            matched
        )));
    }

    let mut nodes: HashMap<String, Node> = HashMap::new();
    for (digest, feature) in resolved {
        let config = &feature.downloaded_feature.devcontainer_feature_config;
        let mut dependencies = HashSet::new();

        for (source, value) in &config.depends_on {
            let dependency = calculate_digest(source, &value.options())?;
            if !resolved.contains_key(&dependency) {
                return Err(Error::FeatureSort(format!(
                    "dependency {} of {} was not resolved",
                    source, feature.downloaded_feature.source
                )));
            }
            dependencies.insert(dependency);
        }
        for after in &config.installs_after {
            if let Some(digests) = digests_by_source.get(&source_without_tag(after)) {
                dependencies.extend(digests.iter().filter(|d| *d != digest).cloned());
            }
        }

        let priority = override_sources
            .iter()
            .position(|s| *s == feature.downloaded_feature.source_without_tag)
            .map(|index| override_sources.len() - index)
            .unwrap_or(0);

        nodes.insert(
            digest.clone(),
            Node {
                feature,
                dependencies,
                priority,
            },
        );
    }

    let mut sorted = Vec::with_capacity(nodes.len());
    while !nodes.is_empty() {
        let ready: Vec<&Node> = nodes.values().filter(|n| n.dependencies.is_empty()).collect();
        let Some(max_priority) = ready.iter().map(|n| n.priority).max() else {
            let remaining: Vec<&str> = nodes
                .values()
                .map(|n| n.feature.downloaded_feature.source.as_str())
                .collect();
            return Err(Error::FeatureSort(format!(
                "features have circular dependencies: {}",
                remaining.join(", ")
            )));
        };

        let mut round: Vec<&ResolvedFeature> = ready
            .into_iter()
            .filter(|n| n.priority == max_priority)
            .map(|n| n.feature)
            .collect();
        round.sort_by(|a, b| compare(a, b));

        let installed: HashSet<String> = round.iter().map(|f| f.digest.clone()).collect();
        for feature in round {
            debug!("Install order {}: {}", sorted.len() + 1, feature.print());
            sorted.push(feature.clone());
        }

        nodes.retain(|digest, _| !installed.contains(digest));
        for node in nodes.values_mut() {
            node.dependencies.retain(|d| !installed.contains(d));
        }
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::devcontainer::{FeatureValue, Features};
    use crate::service::feature::resolve::resolve_features;
    use crate::service::feature::resolve::testing::downloaded;

    const NODE: &str = "ghcr.io/devcontainers/features/node:1";
    const COMMON: &str = "ghcr.io/devcontainers/features/common-utils:2";
    const GO: &str = "ghcr.io/devcontainers/features/go:1";
    const DOCKER: &str = "ghcr.io/devcontainers/features/docker-in-docker:2";

    fn resolve(entries: Vec<(&str, String)>, user: &[&str]) -> HashMap<String, ResolvedFeature> {
        let downloaded: HashMap<_, _> = entries
            .into_iter()
            .map(|(source, manifest)| downloaded(source, &manifest))
            .collect();
        let user: Features = user
            .iter()
            .map(|s| (s.to_string(), FeatureValue::Options(BTreeMap::new())))
            .collect();
        resolve_features(&user, &downloaded).unwrap()
    }

    fn sources(sorted: &[ResolvedFeature]) -> Vec<&str> {
        sorted
            .iter()
            .map(|f| f.downloaded_feature.source.as_str())
            .collect()
    }

    #[test]
    fn test_dependencies_install_first() {
        let resolved = resolve(
            vec![
                (NODE, format!(r#"{{ "id": "node", "dependsOn": {{ "{}": {{}} }} }}"#, COMMON)),
                (COMMON, r#"{ "id": "common-utils" }"#.to_string()),
                (GO, r#"{ "id": "go" }"#.to_string()),
            ],
            &[NODE, GO],
        );

        let sorted = sort_features(&resolved, &[]).unwrap();
        // First round holds both roots, ordered by source
        assert_eq!(sources(&sorted), vec![COMMON, GO, NODE]);
    }

    #[test]
    fn test_installs_after_is_soft() {
        let resolved = resolve(
            vec![
                (
                    COMMON,
                    r#"{ "id": "common-utils", "installsAfter": ["ghcr.io/devcontainers/features/go", "ghcr.io/acme/absent"] }"#
                        .to_string(),
                ),
                (GO, r#"{ "id": "go" }"#.to_string()),
            ],
            &[COMMON, GO],
        );

        let sorted = sort_features(&resolved, &[]).unwrap();
        assert_eq!(sources(&sorted), vec![GO, COMMON]);
    }

    #[test]
    fn test_override_order_priority() {
        let resolved = resolve(
            vec![
                (COMMON, r#"{ "id": "common-utils" }"#.to_string()),
                (DOCKER, r#"{ "id": "docker-in-docker" }"#.to_string()),
                (GO, r#"{ "id": "go" }"#.to_string()),
            ],
            &[COMMON, DOCKER, GO],
        );

        let order = vec![
            "ghcr.io/devcontainers/features/go".to_string(),
            DOCKER.to_string(),
        ];
        let sorted = sort_features(&resolved, &order).unwrap();
        assert_eq!(sources(&sorted), vec![GO, DOCKER, COMMON]);
    }

    #[test]
    fn test_override_order_mismatch_fails() {
        let resolved = resolve(vec![(GO, r#"{ "id": "go" }"#.to_string())], &[GO]);
        let order = vec!["ghcr.io/acme/rust".to_string()];
        assert!(matches!(
            sort_features(&resolved, &order),
            Err(Error::FeatureSort(_))
        ));
    }

    #[test]
    fn test_cycle_fails() {
        let resolved = resolve(
            vec![
                (NODE, format!(r#"{{ "id": "node", "dependsOn": {{ "{}": {{}} }} }}"#, GO)),
                (GO, format!(r#"{{ "id": "go", "dependsOn": {{ "{}": {{}} }} }}"#, NODE)),
            ],
            &[NODE],
        );
        assert_eq!(resolved.len(), 2);

        let err = sort_features(&resolved, &[]).unwrap_err();
        assert!(matches!(err, Error::FeatureSort(_)));
        assert!(err.to_string().contains("circular"));
    }
}
