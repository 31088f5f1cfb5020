//! Metadata labels written on managed resources
//!
//! Labels are the only persistence the engine has: the state manager reads
//! them back to recognise a workspace's containers and to compare the hashes
//! recorded at creation time with the desired ones.

use crate::compose::project_name;
use crate::hash::ContentHashes;
use crate::workspace::{PlanType, Workspace};
use std::collections::BTreeMap;

pub const LABEL_MANAGED_BY: &str = "dev.stevedore.managed-by";
pub const LABEL_WORKSPACE_ID: &str = "dev.stevedore.workspace.id";
pub const LABEL_WORKSPACE_NAME: &str = "dev.stevedore.workspace.name";
pub const LABEL_CONFIG_PATH: &str = "dev.stevedore.config.path";
pub const LABEL_HASH_CONFIG: &str = "dev.stevedore.hash.config";
pub const LABEL_HASH_DOCKERFILE: &str = "dev.stevedore.hash.dockerfile";
pub const LABEL_HASH_COMPOSE: &str = "dev.stevedore.hash.compose";
pub const LABEL_HASH_FEATURES: &str = "dev.stevedore.hash.features";
pub const LABEL_HASH_OVERALL: &str = "dev.stevedore.hash.overall";
pub const LABEL_BUILD_METHOD: &str = "dev.stevedore.build.method";
pub const LABEL_BASE_IMAGE: &str = "dev.stevedore.image.base";
pub const LABEL_DERIVED_IMAGE: &str = "dev.stevedore.image.derived";
pub const LABEL_FEATURES: &str = "dev.stevedore.features";
pub const LABEL_PRIMARY: &str = "dev.stevedore.primary";
pub const LABEL_COMPOSE_PROJECT: &str = "dev.stevedore.compose.project";
pub const LABEL_COMPOSE_SERVICE: &str = "dev.stevedore.compose.service";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY: &str = "stevedore";

/// Label sets for workspace resources
pub struct ResourceLabels;

impl ResourceLabels {
    /// Labels for one resource of `workspace`
    ///
    /// `compose_service` is the service the resource belongs to for compose
    /// plans.
    pub fn for_workspace(
        workspace: &Workspace,
        primary: bool,
        compose_service: Option<&str>,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            labels.insert(key.to_string(), value);
        };

        put(LABEL_MANAGED_BY, MANAGED_BY.to_string());
        put(LABEL_WORKSPACE_ID, workspace.id.clone());
        put(LABEL_WORKSPACE_NAME, workspace.name.clone());
        put(LABEL_CONFIG_PATH, workspace.config_path.display().to_string());

        let hashes = &workspace.hashes;
        put(LABEL_HASH_CONFIG, hashes.config.clone());
        put(LABEL_HASH_DOCKERFILE, hashes.dockerfile.clone());
        put(LABEL_HASH_COMPOSE, hashes.compose.clone());
        put(LABEL_HASH_FEATURES, hashes.features.clone());
        put(LABEL_HASH_OVERALL, hashes.overall.clone());

        put(LABEL_BUILD_METHOD, workspace.plan_type().to_string());
        if let Some(build) = &workspace.build {
            put(LABEL_BASE_IMAGE, build.base_image.clone());
            if let Some(derived) = &build.derived_image {
                put(LABEL_DERIVED_IMAGE, derived.clone());
            }
        } else if let Some(image) = &workspace.resolved.image {
            put(LABEL_BASE_IMAGE, image.clone());
        }
        if workspace.has_features() {
            put(LABEL_FEATURES, workspace.resolved.feature_ids().join(","));
        }
        put(LABEL_PRIMARY, primary.to_string());

        if workspace.plan_type() == PlanType::Compose {
            put(LABEL_COMPOSE_PROJECT, project_name(workspace));
            if let Some(service) = compose_service {
                put(LABEL_COMPOSE_SERVICE, service.to_string());
            }
        }
        labels
    }

    /// Hash set recorded on a resource
    ///
    /// `None` when the resource carries no overall hash.
    pub fn recorded_hashes(labels: &BTreeMap<String, String>) -> Option<ContentHashes> {
        let overall = labels.get(LABEL_HASH_OVERALL)?;
        let get = |key: &str| labels.get(key).cloned().unwrap_or_default();
        Some(ContentHashes {
            config: get(LABEL_HASH_CONFIG),
            dockerfile: get(LABEL_HASH_DOCKERFILE),
            compose: get(LABEL_HASH_COMPOSE),
            features: get(LABEL_HASH_FEATURES),
            overall: overall.clone(),
        })
    }

    /// Filter matching every managed resource of a workspace
    pub fn selector(workspace_id: &str, project: Option<&str>) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        selector.insert(LABEL_WORKSPACE_ID.to_string(), workspace_id.to_string());
        if let Some(project) = project {
            selector.insert(LABEL_COMPOSE_PROJECT.to_string(), project.to_string());
        }
        selector
    }

    /// Whether a resource is marked as the primary one
    pub fn is_primary(labels: &BTreeMap<String, String>) -> bool {
        labels.get(LABEL_PRIMARY).map(String::as_str) == Some("true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_includes_project_when_given() {
        let selector = ResourceLabels::selector("abc", None);
        assert_eq!(selector.len(), 2);
        assert_eq!(selector[LABEL_MANAGED_BY], MANAGED_BY);
        assert_eq!(selector[LABEL_WORKSPACE_ID], "abc");

        let selector = ResourceLabels::selector("abc", Some("proj"));
        assert_eq!(selector[LABEL_COMPOSE_PROJECT], "proj");
    }

    #[test]
    fn test_recorded_hashes_requires_overall() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_HASH_CONFIG.to_string(), "c".to_string());
        assert!(ResourceLabels::recorded_hashes(&labels).is_none());

        labels.insert(LABEL_HASH_OVERALL.to_string(), "o".to_string());
        let hashes = ResourceLabels::recorded_hashes(&labels).unwrap();
        assert_eq!(hashes.config, "c");
        assert_eq!(hashes.overall, "o");
        assert!(hashes.dockerfile.is_empty());
    }

    #[test]
    fn test_is_primary() {
        let mut labels = BTreeMap::new();
        assert!(!ResourceLabels::is_primary(&labels));
        labels.insert(LABEL_PRIMARY.to_string(), "false".to_string());
        assert!(!ResourceLabels::is_primary(&labels));
        labels.insert(LABEL_PRIMARY.to_string(), "true".to_string());
        assert!(ResourceLabels::is_primary(&labels));
    }
}
