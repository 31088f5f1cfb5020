//! Feature resolution, installation order and metadata merging
//!
//! Features are resolved through the [`FeatureResolver`] collaborator into
//! [`ResolvedFeature`] records, ordered with [`install_order`] and folded into
//! the configuration with the typed merge functions in this module.
//!
//! ## Installation order
//!
//! Dependencies come from `installsAfter` and `dependsOn`. Kahn's algorithm
//! picks the next feature among those whose dependencies are installed: first
//! by position in `overrideFeatureInstallOrder`, then by declaration order.
//! A cycle fails with the offending path, e.g. `a -> b -> a`.
//!
//! ## Merge rules
//!
//! | Field | Rule |
//! |---|---|
//! | `privileged`, `init` | OR across configuration and features |
//! | `capAdd` | union, upper-cased, first occurrence kept |
//! | `securityOpt` | union, first occurrence kept |
//! | `mounts` | union keyed by target path, first occurrence kept |
//! | `containerEnv` | later features override earlier ones, the configuration always wins |
//! | `entrypoint` | first feature declaring one |

use crate::config::{DevContainerConfig, MountEntry};
use crate::errors::{FeatureError, Result};
use crate::hash::{hash_bytes, FeatureFingerprint};
use crate::lifecycle::{LifecycleCommandValue, LifecycleCommands};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// File describing a feature inside its directory
pub const FEATURE_METADATA_FILE: &str = "devcontainer-feature.json";

/// Declared option of a feature
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureOption {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub option_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Contents of `devcontainer-feature.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: IndexMap<String, FeatureOption>,
    #[serde(default)]
    pub container_env: IndexMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
    #[serde(default)]
    pub init: Option<bool>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub installs_after: Vec<String>,
    #[serde(default)]
    pub depends_on: IndexMap<String, Value>,
    #[serde(default)]
    pub on_create_command: Option<LifecycleCommandValue>,
    #[serde(default)]
    pub update_content_command: Option<LifecycleCommandValue>,
    #[serde(default)]
    pub post_create_command: Option<LifecycleCommandValue>,
    #[serde(default)]
    pub post_start_command: Option<LifecycleCommandValue>,
    #[serde(default)]
    pub post_attach_command: Option<LifecycleCommandValue>,
}

impl FeatureMetadata {
    /// Lifecycle commands contributed by the feature
    pub fn lifecycle_commands(&self) -> LifecycleCommands {
        LifecycleCommands {
            initialize: None,
            on_create: self.on_create_command.clone(),
            update_content: self.update_content_command.clone(),
            post_create: self.post_create_command.clone(),
            post_start: self.post_start_command.clone(),
            post_attach: self.post_attach_command.clone(),
        }
    }

    pub fn has_lifecycle_commands(&self) -> bool {
        !self.lifecycle_commands().is_empty()
    }

    /// References this feature must be installed after
    pub fn dependencies(&self) -> impl Iterator<Item = &String> {
        self.installs_after.iter().chain(self.depends_on.keys())
    }
}

/// A feature ready for installation
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFeature {
    /// Feature identifier
    pub id: String,
    /// Reference as written in the configuration
    pub reference: String,
    /// Directory holding the feature's files
    pub local_path: PathBuf,
    /// Pinned content digest
    pub digest: String,
    /// Effective options: declared values over option defaults
    pub options: Value,
    pub metadata: FeatureMetadata,
    /// Position in the installation sequence
    pub install_order: usize,
}

impl ResolvedFeature {
    pub fn fingerprint(&self) -> FeatureFingerprint {
        FeatureFingerprint {
            id: self.id.clone(),
            digest: self.digest.clone(),
            options: self.options.clone(),
        }
    }

    /// Whether `reference` (an id or a reference, tag ignored) names this feature
    pub fn answers_to(&self, reference: &str) -> bool {
        let wanted = strip_tag(reference);
        wanted == self.id || wanted == strip_tag(&self.reference)
    }
}

fn strip_tag(reference: &str) -> &str {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].find(&['@', ':'][..]) {
        Some(offset) => &reference[..name_start + offset],
        None => reference,
    }
}

/// Resolves a feature reference into a [`ResolvedFeature`]
#[async_trait]
pub trait FeatureResolver: Send + Sync {
    /// Resolve `feature_ref` with its declared options
    ///
    /// Relative references are resolved against `config_dir`.
    async fn resolve(
        &self,
        feature_ref: &str,
        options: &Value,
        config_dir: &Path,
    ) -> Result<ResolvedFeature>;
}

/// Declared options in object form
///
/// A string is shorthand for `{"version": <string>}`; `true` and `null` mean
/// no options.
pub fn normalize_options(value: &Value) -> Value {
    match value {
        Value::Object(_) => value.clone(),
        Value::String(version) => serde_json::json!({ "version": version }),
        _ => Value::Object(Default::default()),
    }
}

/// Fill in option defaults the user did not set
pub fn apply_option_defaults(declared: &Value, metadata: &FeatureMetadata) -> Value {
    let mut options = match normalize_options(declared) {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    for (name, spec) in &metadata.options {
        if let Some(default) = &spec.default {
            options
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    Value::Object(options)
}

/// Resolves features stored next to the configuration (`./name` references)
///
/// The digest covers every file in the feature directory. Registry references
/// are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFeatureResolver;

impl LocalFeatureResolver {
    pub fn new() -> Self {
        Self
    }

    fn is_local(reference: &str) -> bool {
        reference.starts_with("./")
            || reference.starts_with("../")
            || Path::new(reference).is_absolute()
    }
}

#[async_trait]
impl FeatureResolver for LocalFeatureResolver {
    #[instrument(skip(self, options))]
    async fn resolve(
        &self,
        feature_ref: &str,
        options: &Value,
        config_dir: &Path,
    ) -> Result<ResolvedFeature> {
        if !Self::is_local(feature_ref) {
            return Err(FeatureError::Resolution {
                feature: feature_ref.to_string(),
                message: "only local feature directories can be resolved".to_string(),
            }
            .into());
        }

        let local_path = config_dir.join(feature_ref);
        let metadata_path = local_path.join(FEATURE_METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(FeatureError::NotFound {
                feature: feature_ref.to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(&metadata_path).map_err(|e| {
            FeatureError::Resolution {
                feature: feature_ref.to_string(),
                message: e.to_string(),
            }
        })?;
        let metadata: FeatureMetadata = json5::from_str::<Value>(&content)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_value(raw).map_err(|e| e.to_string()))
            .map_err(|message| FeatureError::Metadata {
                feature: feature_ref.to_string(),
                message,
            })?;

        let id = if metadata.id.is_empty() {
            local_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| feature_ref.to_string())
        } else {
            metadata.id.clone()
        };

        let digest = directory_digest(&local_path).map_err(|e| FeatureError::Resolution {
            feature: feature_ref.to_string(),
            message: format!("failed to hash feature directory: {}", e),
        })?;
        let options = apply_option_defaults(options, &metadata);

        debug!("Resolved local feature {} ({})", id, digest);
        Ok(ResolvedFeature {
            id,
            reference: feature_ref.to_string(),
            local_path,
            digest,
            options,
            metadata,
            install_order: 0,
        })
    }
}

/// `sha256:` digest over relative paths and contents of every file under `root`
fn directory_digest(root: &Path) -> std::io::Result<String> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut record = Vec::new();
    for relative in files {
        record.extend_from_slice(relative.to_string_lossy().as_bytes());
        record.push(0);
        record.extend_from_slice(&std::fs::read(root.join(&relative))?);
        record.push(0);
    }
    Ok(format!("sha256:{}", hash_bytes(&record)))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Order features for installation
///
/// `features` must be in declaration order. The returned features carry their
/// position in `install_order`.
#[instrument(level = "debug", skip_all, fields(count = features.len()))]
pub fn install_order(
    features: Vec<ResolvedFeature>,
    override_order: Option<&[String]>,
) -> std::result::Result<Vec<ResolvedFeature>, FeatureError> {
    let override_order = override_order.unwrap_or_default();
    for wanted in override_order {
        if !features.iter().any(|f| f.answers_to(wanted)) {
            return Err(FeatureError::UnknownOverride {
                feature: wanted.clone(),
            });
        }
    }

    // dependencies[i] holds indices feature i installs after
    let dependencies: Vec<Vec<usize>> = features
        .iter()
        .map(|feature| {
            let mut deps = Vec::new();
            for reference in feature.metadata.dependencies() {
                match features.iter().position(|other| other.answers_to(reference)) {
                    Some(index) if !deps.contains(&index) => deps.push(index),
                    Some(_) => {}
                    None => warn!(
                        "Feature '{}' depends on '{}' which is not in the feature set",
                        feature.id, reference
                    ),
                }
            }
            deps
        })
        .collect();

    let priority = |index: usize| -> usize {
        override_order
            .iter()
            .position(|wanted| features[index].answers_to(wanted))
            .unwrap_or(override_order.len())
    };

    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); features.len()];
    for (index, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(index);
        }
    }

    let mut ready: BTreeSet<(usize, usize)> = (0..features.len())
        .filter(|&i| in_degree[i] == 0)
        .map(|i| (priority(i), i))
        .collect();
    let mut order = Vec::with_capacity(features.len());

    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        let (_, index) = next;
        order.push(index);
        for &dependent in &dependents[index] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((priority(dependent), dependent));
            }
        }
    }

    if order.len() != features.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let remaining: Vec<usize> = (0..features.len()).filter(|i| !placed.contains(i)).collect();
        let cycle_path = find_cycle_path(&dependencies, &remaining)
            .map(|path| {
                path.iter()
                    .map(|&i| features[i].id.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            })
            .unwrap_or_else(|| "Cycle detected but path could not be determined".to_string());
        return Err(FeatureError::DependencyCycle { cycle_path });
    }

    let mut slots: Vec<Option<ResolvedFeature>> = features.into_iter().map(Some).collect();
    let ordered = order
        .into_iter()
        .enumerate()
        .filter_map(|(position, index)| {
            slots[index].take().map(|mut feature| {
                feature.install_order = position;
                feature
            })
        })
        .collect::<Vec<_>>();
    debug!(
        "Feature installation order: {:?}",
        ordered.iter().map(|f| f.id.as_str()).collect::<Vec<_>>()
    );
    Ok(ordered)
}

fn find_cycle_path(dependencies: &[Vec<usize>], remaining: &[usize]) -> Option<Vec<usize>> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();
    remaining.iter().find_map(|&start| {
        if visited.contains(&start) {
            return None;
        }
        dfs_find_cycle(start, dependencies, &mut visited, &mut on_stack, &mut path)
    })
}

fn dfs_find_cycle(
    node: usize,
    dependencies: &[Vec<usize>],
    visited: &mut HashSet<usize>,
    on_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    for &dep in &dependencies[node] {
        if !visited.contains(&dep) {
            if let Some(cycle) = dfs_find_cycle(dep, dependencies, visited, on_stack, path) {
                return Some(cycle);
            }
        } else if on_stack.contains(&dep) {
            let start = path.iter().position(|&n| n == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
    }

    path.pop();
    on_stack.remove(&node);
    None
}

/// First value present wins
pub fn merge_first_wins<'a, I>(values: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    values.into_iter().flatten().next().map(str::to_string)
}

/// True if any value is `Some(true)`
pub fn merge_bool_or<I>(values: I) -> bool
where
    I: IntoIterator<Item = Option<bool>>,
{
    values.into_iter().any(|v| v == Some(true))
}

/// Concatenate lists, keeping the first occurrence of each value
pub fn merge_union<'a, I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a [String]>,
{
    let mut seen = HashSet::new();
    lists
        .into_iter()
        .flatten()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

/// Concatenate mount lists, keeping the first mount for each target path
///
/// Mounts whose target cannot be determined are de-duplicated by value.
pub fn merge_mounts_by_target<'a, I>(lists: I) -> Vec<MountEntry>
where
    I: IntoIterator<Item = &'a [MountEntry]>,
{
    let mut targets = HashSet::new();
    let mut merged: Vec<MountEntry> = Vec::new();
    for mount in lists.into_iter().flatten() {
        let keep = match mount.target() {
            Some(target) => targets.insert(target),
            None => !merged.contains(mount),
        };
        if keep {
            merged.push(mount.clone());
        }
    }
    merged
}

/// Merge feature environment maps under the base map
///
/// Later features override earlier ones; the base value always wins.
pub fn merge_env_base_wins<'a, I>(
    base: &IndexMap<String, String>,
    features: I,
) -> IndexMap<String, String>
where
    I: IntoIterator<Item = &'a IndexMap<String, String>>,
{
    let mut merged = IndexMap::new();
    for env in features {
        for (key, value) in env {
            merged.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in base {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Result of folding feature metadata into a configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedFeatureConfig {
    pub privileged: bool,
    pub init: bool,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub mounts: Vec<MountEntry>,
    pub container_env: IndexMap<String, String>,
    pub entrypoint: Option<String>,
}

impl MergedFeatureConfig {
    /// Merge `features` (in installation order) with the configuration
    pub fn merge(config: &DevContainerConfig, features: &[ResolvedFeature]) -> Self {
        let metadata: Vec<&FeatureMetadata> = features.iter().map(|f| &f.metadata).collect();

        let config_caps: Vec<String> = config.cap_add.iter().map(|c| c.to_uppercase()).collect();
        let feature_caps: Vec<Vec<String>> = metadata
            .iter()
            .map(|m| m.cap_add.iter().map(|c| c.to_uppercase()).collect())
            .collect();

        Self {
            privileged: merge_bool_or(
                std::iter::once(config.privileged).chain(metadata.iter().map(|m| m.privileged)),
            ),
            init: merge_bool_or(std::iter::once(config.init).chain(metadata.iter().map(|m| m.init))),
            cap_add: merge_union(
                std::iter::once(config_caps.as_slice())
                    .chain(feature_caps.iter().map(Vec::as_slice)),
            ),
            security_opt: merge_union(
                std::iter::once(config.security_opt.as_slice())
                    .chain(metadata.iter().map(|m| m.security_opt.as_slice())),
            ),
            mounts: merge_mounts_by_target(
                std::iter::once(config.mounts.as_slice())
                    .chain(metadata.iter().map(|m| m.mounts.as_slice())),
            ),
            container_env: merge_env_base_wins(
                &config.container_env,
                metadata.iter().map(|m| &m.container_env),
            ),
            entrypoint: merge_first_wins(metadata.iter().map(|m| m.entrypoint.as_deref())),
        }
    }

    /// Write the merged values back into `config`
    pub fn apply_to(&self, config: &mut DevContainerConfig) {
        if self.privileged {
            config.privileged = Some(true);
        }
        if self.init {
            config.init = Some(true);
        }
        config.cap_add = self.cap_add.clone();
        config.security_opt = self.security_opt.clone();
        config.mounts = self.mounts.clone();
        config.container_env = self.container_env.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleHook;
    use serde_json::json;
    use tempfile::TempDir;

    fn feature(id: &str, installs_after: &[&str]) -> ResolvedFeature {
        ResolvedFeature {
            id: id.to_string(),
            reference: format!("./{}", id),
            local_path: PathBuf::from(id),
            digest: format!("sha256:{}", id),
            options: json!({}),
            metadata: FeatureMetadata {
                id: id.to_string(),
                installs_after: installs_after.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            install_order: 0,
        }
    }

    fn ids(features: &[ResolvedFeature]) -> Vec<&str> {
        features.iter().map(|f| f.id.as_str()).collect()
    }

    #[test]
    fn test_independent_features_keep_declaration_order() {
        let ordered = install_order(
            vec![feature("zsh", &[]), feature("git", &[]), feature("node", &[])],
            None,
        )
        .unwrap();
        assert_eq!(ids(&ordered), vec!["zsh", "git", "node"]);
        assert_eq!(
            ordered.iter().map(|f| f.install_order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_dependencies_come_first() {
        let ordered = install_order(
            vec![
                feature("app", &["node"]),
                feature("node", &["common"]),
                feature("common", &[]),
            ],
            None,
        )
        .unwrap();
        assert_eq!(ids(&ordered), vec!["common", "node", "app"]);
    }

    #[test]
    fn test_depends_on_and_tagged_references() {
        let mut app = feature("app", &[]);
        app.metadata
            .depends_on
            .insert("./node:1".to_string(), json!({}));
        let ordered = install_order(vec![app, feature("node", &[])], None).unwrap();
        assert_eq!(ids(&ordered), vec!["node", "app"]);
    }

    #[test]
    fn test_override_order_prioritizes_ready_features() {
        let override_order = vec!["node".to_string(), "git".to_string()];
        let ordered = install_order(
            vec![feature("git", &[]), feature("zsh", &[]), feature("node", &[])],
            Some(&override_order),
        )
        .unwrap();
        assert_eq!(ids(&ordered), vec!["node", "git", "zsh"]);
    }

    #[test]
    fn test_override_order_cannot_break_dependencies() {
        let override_order = vec!["app".to_string()];
        let ordered = install_order(
            vec![feature("node", &[]), feature("app", &["node"])],
            Some(&override_order),
        )
        .unwrap();
        assert_eq!(ids(&ordered), vec!["node", "app"]);
    }

    #[test]
    fn test_unknown_override_is_error() {
        let override_order = vec!["missing".to_string()];
        let err = install_order(vec![feature("git", &[])], Some(&override_order)).unwrap_err();
        assert!(matches!(err, FeatureError::UnknownOverride { .. }));
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = install_order(
            vec![
                feature("a", &["b"]),
                feature("b", &["a"]),
                feature("c", &[]),
            ],
            None,
        )
        .unwrap_err();
        match err {
            FeatureError::DependencyCycle { cycle_path } => assert_eq!(cycle_path, "a -> b -> a"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_dependency_is_ignored() {
        let ordered = install_order(vec![feature("app", &["ghost"])], None).unwrap();
        assert_eq!(ids(&ordered), vec!["app"]);
    }

    #[test]
    fn test_merge_functions() {
        assert_eq!(
            merge_first_wins([None, Some("a"), Some("b")]),
            Some("a".to_string())
        );
        assert!(merge_bool_or([None, Some(false), Some(true)]));
        assert!(!merge_bool_or([None, Some(false)]));

        let a = vec!["X".to_string(), "Y".to_string()];
        let b = vec!["Y".to_string(), "Z".to_string()];
        assert_eq!(merge_union([a.as_slice(), b.as_slice()]), vec!["X", "Y", "Z"]);
    }

    #[test]
    fn test_mounts_deduplicated_by_target() {
        let base = vec![MountEntry::Spec("type=bind,source=/a,target=/data".to_string())];
        let feature = vec![
            MountEntry::Spec("type=volume,source=v,target=/data".to_string()),
            MountEntry::Spec("type=volume,source=c,target=/cache".to_string()),
        ];
        let merged = merge_mounts_by_target([base.as_slice(), feature.as_slice()]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], base[0]);
        assert_eq!(merged[1].target().as_deref(), Some("/cache"));
    }

    #[test]
    fn test_env_base_always_wins() {
        let mut base = IndexMap::new();
        base.insert("PATH".to_string(), "/base".to_string());
        let mut first = IndexMap::new();
        first.insert("PATH".to_string(), "/feature".to_string());
        first.insert("A".to_string(), "1".to_string());
        let mut second = IndexMap::new();
        second.insert("A".to_string(), "2".to_string());

        let merged = merge_env_base_wins(&base, [&first, &second]);
        assert_eq!(merged["PATH"], "/base");
        assert_eq!(merged["A"], "2");
    }

    #[test]
    fn test_merged_feature_config() {
        let config = DevContainerConfig {
            cap_add: vec!["sys_ptrace".to_string()],
            ..Default::default()
        };
        let mut docker = feature("docker", &[]);
        docker.metadata.privileged = Some(true);
        docker.metadata.cap_add = vec!["SYS_PTRACE".to_string(), "NET_ADMIN".to_string()];
        docker.metadata.security_opt = vec!["seccomp=unconfined".to_string()];
        docker.metadata.entrypoint = Some("/usr/local/share/docker-init.sh".to_string());

        let merged = MergedFeatureConfig::merge(&config, &[docker]);
        assert!(merged.privileged);
        assert!(!merged.init);
        assert_eq!(merged.cap_add, vec!["SYS_PTRACE", "NET_ADMIN"]);
        assert_eq!(merged.security_opt, vec!["seccomp=unconfined"]);
        assert!(merged.entrypoint.is_some());

        let mut applied = config.clone();
        merged.apply_to(&mut applied);
        assert_eq!(applied.privileged, Some(true));
    }

    #[test]
    fn test_option_normalization_and_defaults() {
        let metadata = FeatureMetadata {
            options: [(
                "version".to_string(),
                FeatureOption {
                    default: Some(json!("lts")),
                    ..Default::default()
                },
            ), (
                "pnpm".to_string(),
                FeatureOption {
                    default: Some(json!(false)),
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        assert_eq!(
            apply_option_defaults(&json!("20"), &metadata),
            json!({"version": "20", "pnpm": false})
        );
        assert_eq!(
            apply_option_defaults(&json!(true), &metadata),
            json!({"version": "lts", "pnpm": false})
        );
    }

    #[tokio::test]
    async fn test_local_resolver_reads_metadata_and_hashes() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("hello");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join(FEATURE_METADATA_FILE),
            r#"{
                "id": "hello",
                "options": { "greeting": { "type": "string", "default": "hi" } },
                "postCreateCommand": "hello --check",
            }"#,
        )?;
        std::fs::write(dir.join("install.sh"), "#!/bin/sh\necho hello\n")?;

        let resolver = LocalFeatureResolver::new();
        let resolved = resolver.resolve("./hello", &json!({}), temp.path()).await?;
        assert_eq!(resolved.id, "hello");
        assert_eq!(resolved.options, json!({"greeting": "hi"}));
        assert!(resolved.digest.starts_with("sha256:"));
        assert!(resolved
            .metadata
            .lifecycle_commands()
            .get(LifecycleHook::PostCreate)
            .is_some());

        std::fs::write(dir.join("install.sh"), "#!/bin/sh\necho changed\n")?;
        let changed = resolver.resolve("./hello", &json!({}), temp.path()).await?;
        assert_ne!(resolved.digest, changed.digest);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_resolver_errors_name_feature() {
        let temp = TempDir::new().unwrap();
        let resolver = LocalFeatureResolver::new();

        let err = resolver
            .resolve("./missing", &json!({}), temp.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("./missing"));

        let err = resolver
            .resolve("ghcr.io/devcontainers/features/node:1", &json!({}), temp.path())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("ghcr.io/devcontainers/features/node:1"));
    }
}
