//! Workspace resolution
//!
//! A [`Workspace`] is the resolved, hashed description of one project's
//! desired environment. [`WorkspaceBuilder`] produces it from a parsed
//! configuration and host paths:
//!
//! 1. The workspace root is canonicalized and its identifier derived from it
//! 2. The plan type is selected (compose, then Dockerfile, then image)
//! 3. Variables are substituted in every string-bearing field
//! 4. Features are resolved, ordered and merged when a resolver is supplied
//! 5. Content hashes are computed over the resolved state

use crate::config::{DevContainerConfig, MountEntry, ParsedConfig};
use crate::errors::{ConfigError, FeatureError, Result, StevedoreError};
use crate::features::{install_order, FeatureResolver, MergedFeatureConfig, ResolvedFeature};
use crate::hash::{canonical_json, ContentHashes, FeatureFingerprint, HashInputs};
use crate::lifecycle::{LifecycleCommands, LifecycleHook};
use crate::state::RuntimeState;
use crate::variable::{
    substitute_json, Substitute, SubstitutionContext, SubstitutionReport,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Length of the workspace identifier
pub const WORKSPACE_ID_LEN: usize = 12;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// How the container image is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Image,
    Dockerfile,
    Compose,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Image => "image",
            PlanType::Dockerfile => "dockerfile",
            PlanType::Compose => "compose",
        }
    }

    /// Select the plan type of a configuration
    pub fn select(config: &DevContainerConfig, config_path: &Path) -> Result<Self> {
        if config.uses_compose() {
            Ok(PlanType::Compose)
        } else if config.has_build() {
            Ok(PlanType::Dockerfile)
        } else if config.image.is_some() {
            Ok(PlanType::Image)
        } else {
            Err(ConfigError::MissingPlan {
                path: config_path.display().to_string(),
            }
            .into())
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dockerfile build inputs
#[derive(Debug, Clone, PartialEq)]
pub struct DockerfilePlan {
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub content: String,
    pub args: IndexMap<String, String>,
    pub target: Option<String>,
}

/// Compose inputs
#[derive(Debug, Clone, PartialEq)]
pub struct ComposePlan {
    /// Absolute compose file paths in declaration order
    pub files: Vec<PathBuf>,
    /// File contents keyed by the path as declared
    pub contents: BTreeMap<String, String>,
    /// Primary service
    pub service: String,
    pub run_services: Vec<String>,
}

/// The fully resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub plan_type: PlanType,
    /// Substituted and feature-merged configuration
    pub config: DevContainerConfig,
    pub image: Option<String>,
    pub dockerfile: Option<DockerfilePlan>,
    pub compose: Option<ComposePlan>,
    /// Workspace folder inside the container
    pub workspace_folder: String,
    /// `--mount` argument for the workspace
    pub workspace_mount: String,
    /// Features in installation order
    pub features: Vec<ResolvedFeature>,
    pub entrypoint: Option<String>,
    pub lifecycle: LifecycleCommands,
}

impl ResolvedConfig {
    /// User for container-side commands
    pub fn exec_user(&self) -> Option<&str> {
        self.config
            .remote_user
            .as_deref()
            .or(self.config.container_user.as_deref())
    }

    /// Environment for container-side commands
    pub fn exec_env(&self) -> HashMap<String, String> {
        self.config
            .remote_env
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn feature_ids(&self) -> Vec<String> {
        self.features.iter().map(|f| f.id.clone()).collect()
    }
}

/// Result of the build stage
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    /// Image pulled or built from the Dockerfile
    pub base_image: String,
    /// Image with the feature layer, when features are present
    pub derived_image: Option<String>,
    pub duration: Duration,
}

impl BuildInfo {
    /// Image the container runs
    pub fn final_image(&self) -> &str {
        self.derived_image.as_deref().unwrap_or(&self.base_image)
    }
}

/// Resolved model of one project's desired environment
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub raw_config: ParsedConfig,
    pub resolved: ResolvedConfig,
    pub hashes: ContentHashes,
    /// Populated after inspecting a live resource
    pub state: Option<RuntimeState>,
    /// Populated by the build stage
    pub build: Option<BuildInfo>,
}

impl Workspace {
    pub fn plan_type(&self) -> PlanType {
        self.resolved.plan_type
    }

    /// Name of the primary container of single-container plans
    pub fn container_name(&self) -> String {
        format!("stevedore-{}", self.id)
    }

    /// Tag of the image built from the Dockerfile
    pub fn built_image_name(&self) -> String {
        format!("stevedore-{}", self.id)
    }

    /// Tag of the feature-derived image
    pub fn derived_image_name(&self) -> String {
        format!("stevedore-{}-features", self.id)
    }

    pub fn has_features(&self) -> bool {
        !self.resolved.features.is_empty()
    }
}

/// Canonical absolute workspace root, symlinks resolved
#[instrument]
pub fn resolve_workspace_root(path: &Path) -> Result<PathBuf> {
    let canonical = path.canonicalize().map_err(|e| {
        debug!("Failed to canonicalize workspace path: {}", e);
        ConfigError::NotFound {
            path: path.display().to_string(),
        }
    })?;
    debug!("Workspace root: {}", canonical.display());
    Ok(canonical)
}

/// Stable identifier of a canonical workspace root
///
/// Lowercase base32 of the SHA-256 of the path, first 12 characters.
pub fn workspace_id(canonical_root: &Path) -> String {
    let digest = Sha256::digest(canonical_root.to_string_lossy().as_bytes());
    let mut encoded = base32_lower(&digest);
    encoded.truncate(WORKSPACE_ID_LEN);
    encoded
}

/// RFC 4648 base32, lowercase, without padding
fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8 + 4) / 5);
    let mut buffer: u16 = 0;
    let mut bits = 0u8;
    for &byte in bytes {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[usize::from((buffer >> bits) & 0x1f)] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[usize::from((buffer << (5 - bits)) & 0x1f)] as char);
    }
    out
}

/// Builds [`Workspace`] values
pub struct WorkspaceBuilder<'a> {
    substitute: &'a dyn Substitute,
    local_env: Option<HashMap<String, String>>,
}

impl<'a> WorkspaceBuilder<'a> {
    pub fn new(substitute: &'a dyn Substitute) -> Self {
        Self {
            substitute,
            local_env: None,
        }
    }

    /// Use a fixed host environment instead of the process environment
    pub fn with_local_env(mut self, local_env: HashMap<String, String>) -> Self {
        self.local_env = Some(local_env);
        self
    }

    /// Resolve a parsed configuration into a workspace
    ///
    /// Features are resolved only when `resolver` is given.
    #[instrument(skip_all, fields(workspace_root = %workspace_root.display()))]
    pub async fn build(
        &self,
        parsed: &ParsedConfig,
        workspace_root: &Path,
        config_path: &Path,
        name_override: Option<&str>,
        resolver: Option<&dyn FeatureResolver>,
    ) -> Result<Workspace> {
        let root = resolve_workspace_root(workspace_root)?;
        let id = workspace_id(&root);
        let config_path = if config_path.is_absolute() {
            config_path.to_path_buf()
        } else {
            root.join(config_path)
        };
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.clone());

        let plan_type = PlanType::select(&parsed.config, &config_path)?;
        let basename = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| id.clone());

        let mut context = SubstitutionContext::new(&root, id.clone());
        if let Some(env) = &self.local_env {
            context = context.with_local_env(env.clone());
        }
        let mut report = SubstitutionReport::new();

        let workspace_folder = match &parsed.config.workspace_folder {
            Some(folder) => self.substitute.substitute(folder, &context, &mut report),
            None => format!("/workspaces/{}", basename),
        };
        let context = context.with_container_workspace_folder(workspace_folder.clone());

        let mut config = self.substitute_config(&parsed.config, &context, &mut report);
        let workspace_mount = config.workspace_mount.clone().unwrap_or_else(|| {
            format!(
                "type=bind,source={},target={}",
                root.display(),
                workspace_folder
            )
        });

        let dockerfile = match plan_type {
            PlanType::Dockerfile => Some(load_dockerfile_plan(&config, &config_dir)?),
            _ => None,
        };
        let compose = match plan_type {
            PlanType::Compose => Some(load_compose_plan(&config, &config_dir)?),
            _ => None,
        };

        let features = match resolver {
            Some(resolver) if !config.features.is_empty() => {
                let mut resolved = Vec::with_capacity(config.features.len());
                for (reference, options) in &config.features {
                    if options == &serde_json::Value::Bool(false) {
                        debug!("Feature {} disabled", reference);
                        continue;
                    }
                    let mut feature = resolver
                        .resolve(reference, options, &config_dir)
                        .await
                        .map_err(|e| attribute_to_feature(e, reference))?;
                    self.substitute_feature_hooks(&mut feature, &context, &mut report);
                    resolved.push(feature);
                }
                install_order(resolved, config.override_feature_install_order.as_deref())?
            }
            _ => Vec::new(),
        };

        let merged = MergedFeatureConfig::merge(&config, &features);
        merged.apply_to(&mut config);

        let substituted_raw = substitute_json(self.substitute, &parsed.raw, &context, &mut report);
        let raw_bytes = canonical_json(&substituted_raw).into_bytes();
        let declared_features = substituted_raw
            .get("features")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let empty_compose = BTreeMap::new();
        let fingerprints: Vec<FeatureFingerprint> =
            features.iter().map(ResolvedFeature::fingerprint).collect();
        let hashes = ContentHashes::compute(&HashInputs {
            raw_config: &raw_bytes,
            declared_features: &declared_features,
            dockerfile: dockerfile.as_ref().map(|d| d.content.as_str()),
            compose: compose.as_ref().map(|c| &c.contents).unwrap_or(&empty_compose),
            features: &fingerprints,
        })?;

        if !report.unknown_variables.is_empty() {
            debug!("Unresolved variables: {:?}", report.unknown_variables);
        }

        let name = name_override
            .map(str::to_string)
            .or_else(|| config.name.clone())
            .unwrap_or(basename);

        debug!(
            "Built workspace {} ({}) plan={} overall={}",
            name, id, plan_type, hashes.overall
        );

        let lifecycle = config.lifecycle_commands();
        Ok(Workspace {
            id,
            name,
            root,
            config_path,
            raw_config: parsed.clone(),
            resolved: ResolvedConfig {
                plan_type,
                image: config.image.clone(),
                dockerfile,
                compose,
                workspace_folder,
                workspace_mount,
                features,
                entrypoint: merged.entrypoint,
                lifecycle,
                config,
            },
            hashes,
            state: None,
            build: None,
        })
    }

    fn substitute_config(
        &self,
        config: &DevContainerConfig,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> DevContainerConfig {
        let sub = |value: &str, report: &mut SubstitutionReport| {
            self.substitute.substitute(value, context, report)
        };

        let mut out = config.clone();
        out.image = config.image.as_deref().map(|v| sub(v, report));
        out.workspace_folder = config.workspace_folder.as_deref().map(|v| sub(v, report));
        out.workspace_mount = config.workspace_mount.as_deref().map(|v| sub(v, report));
        out.container_user = config.container_user.as_deref().map(|v| sub(v, report));
        out.remote_user = config.remote_user.as_deref().map(|v| sub(v, report));
        out.run_args = config.run_args.iter().map(|v| sub(v, report)).collect();
        out.mounts = config
            .mounts
            .iter()
            .map(|mount| match mount {
                MountEntry::Spec(spec) => MountEntry::Spec(sub(spec, report)),
                MountEntry::Structured(object) => {
                    let mut object = object.clone();
                    object.source = object.source.as_deref().map(|v| sub(v, report));
                    object.target = sub(&object.target, report);
                    MountEntry::Structured(object)
                }
            })
            .collect();
        out.container_env = config
            .container_env
            .iter()
            .map(|(k, v)| (k.clone(), sub(v, report)))
            .collect();
        out.remote_env = config
            .remote_env
            .iter()
            .map(|(k, v)| (k.clone(), v.as_deref().map(|v| sub(v, report))))
            .collect();
        if let Some(build) = out.build.as_mut() {
            build.args = build
                .args
                .iter()
                .map(|(k, v)| (k.clone(), sub(v, report)))
                .collect();
        }
        out.set_lifecycle_commands(
            config
                .lifecycle_commands()
                .substitute(self.substitute, context, report),
        );
        out
    }

    fn substitute_feature_hooks(
        &self,
        feature: &mut ResolvedFeature,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) {
        let commands = feature
            .metadata
            .lifecycle_commands()
            .substitute(self.substitute, context, report);
        let metadata = &mut feature.metadata;
        metadata.on_create_command = commands.get(LifecycleHook::OnCreate).cloned();
        metadata.update_content_command = commands.get(LifecycleHook::UpdateContent).cloned();
        metadata.post_create_command = commands.get(LifecycleHook::PostCreate).cloned();
        metadata.post_start_command = commands.get(LifecycleHook::PostStart).cloned();
        metadata.post_attach_command = commands.get(LifecycleHook::PostAttach).cloned();
    }
}

fn read_required(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        debug!("Failed to read {}: {}", path.display(), e);
        ConfigError::NotFound {
            path: path.display().to_string(),
        }
        .into()
    })
}

/// Resolver failures that do not already carry a feature are tied to `reference`
fn attribute_to_feature(error: StevedoreError, reference: &str) -> StevedoreError {
    match error.root() {
        StevedoreError::Feature(_) => error,
        other => FeatureError::Resolution {
            feature: reference.to_string(),
            message: other.to_string(),
        }
        .into(),
    }
}

fn load_dockerfile_plan(config: &DevContainerConfig, config_dir: &Path) -> Result<DockerfilePlan> {
    let dockerfile = config_dir.join(
        config
            .dockerfile_path()
            .unwrap_or_else(|| "Dockerfile".to_string()),
    );
    let content = read_required(&dockerfile)?;
    let build = config.build.clone().unwrap_or_default();
    Ok(DockerfilePlan {
        dockerfile,
        context: config_dir.join(config.build_context()),
        content,
        args: build.args,
        target: build.target,
    })
}

fn load_compose_plan(config: &DevContainerConfig, config_dir: &Path) -> Result<ComposePlan> {
    let service = config.service.clone().ok_or_else(|| ConfigError::Validation {
        message: "'dockerComposeFile' requires a 'service'".to_string(),
    })?;
    let mut files = Vec::new();
    let mut contents = BTreeMap::new();
    for declared in config.compose_files() {
        let path = config_dir.join(&declared);
        contents.insert(declared, read_required(&path)?);
        files.push(path);
    }
    Ok(ComposePlan {
        files,
        contents,
        service,
        run_services: config.run_services.clone(),
    })
}
