//! Development container configuration
//!
//! This module models `devcontainer.json` and locates and parses it. Files are
//! read as JSON-with-comments through `json5`. Besides the typed
//! [`DevContainerConfig`], loading keeps the raw document and its canonical
//! serialization, which is what content hashing consumes.
//!
//! ## Discovery order
//!
//! 1. `.devcontainer/devcontainer.json`, then `.devcontainer/devcontainer.jsonc`
//! 2. `.devcontainer.json`, then `.devcontainer.jsonc` in the workspace root
//! 3. `.devcontainer/<name>/devcontainer.json[c]` when exactly one such folder exists

use crate::errors::{ConfigError, Result};
use crate::lifecycle::{LifecycleCommandValue, LifecycleCommands, LifecycleHook};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// A value that may be written as a single string or an array of strings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s.clone()],
            StringOrVec::Many(v) => v.clone(),
        }
    }
}

/// Structured mount declaration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MountObject {
    #[serde(rename = "type", default = "default_mount_type")]
    pub mount_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub target: String,
}

fn default_mount_type() -> String {
    "bind".to_string()
}

/// A mount in either docker `--mount` string syntax or object syntax
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MountEntry {
    Spec(String),
    Structured(MountObject),
}

impl MountEntry {
    /// Target path inside the container, used to de-duplicate mounts
    pub fn target(&self) -> Option<String> {
        match self {
            MountEntry::Structured(m) => Some(m.target.clone()),
            MountEntry::Spec(spec) => spec.split(',').find_map(|part| {
                let (key, value) = part.split_once('=')?;
                matches!(key.trim(), "target" | "dst" | "destination")
                    .then(|| value.trim().to_string())
            }),
        }
    }

    /// Render as a `--mount` argument
    pub fn to_mount_arg(&self) -> String {
        match self {
            MountEntry::Spec(spec) => spec.clone(),
            MountEntry::Structured(m) => match &m.source {
                Some(source) => format!(
                    "type={},source={},target={}",
                    m.mount_type, source, m.target
                ),
                None => format!("type={},target={}", m.mount_type, m.target),
            },
        }
    }
}

/// `build` section for Dockerfile-based plans
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_from: Option<StringOrVec>,
}

/// Typed view of `devcontainer.json`
///
/// Fields not modelled here are still part of the raw document and therefore
/// of the configuration hash.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevContainerConfig {
    pub name: Option<String>,

    /// Image plan
    pub image: Option<String>,

    /// Legacy Dockerfile location, relative to the configuration file
    #[serde(rename = "dockerFile")]
    pub dockerfile: Option<String>,

    /// Legacy build context, relative to the configuration file
    pub context: Option<String>,

    /// Dockerfile plan
    pub build: Option<BuildConfig>,

    /// Compose plan
    pub docker_compose_file: Option<StringOrVec>,

    /// Primary compose service
    pub service: Option<String>,

    #[serde(default)]
    pub run_services: Vec<String>,

    /// Feature references mapped to their options, in declaration order
    #[serde(default)]
    pub features: IndexMap<String, serde_json::Value>,

    pub override_feature_install_order: Option<Vec<String>>,

    pub workspace_folder: Option<String>,
    pub workspace_mount: Option<String>,

    #[serde(default)]
    pub mounts: Vec<MountEntry>,

    #[serde(default)]
    pub container_env: IndexMap<String, String>,

    #[serde(default)]
    pub remote_env: IndexMap<String, Option<String>>,

    pub container_user: Option<String>,
    pub remote_user: Option<String>,

    #[serde(default)]
    pub forward_ports: Vec<serde_json::Value>,

    #[serde(default)]
    pub run_args: Vec<String>,

    pub override_command: Option<bool>,
    pub shutdown_action: Option<String>,

    pub privileged: Option<bool>,
    pub init: Option<bool>,

    #[serde(default)]
    pub cap_add: Vec<String>,

    #[serde(default)]
    pub security_opt: Vec<String>,

    pub initialize_command: Option<LifecycleCommandValue>,
    pub on_create_command: Option<LifecycleCommandValue>,
    pub update_content_command: Option<LifecycleCommandValue>,
    pub post_create_command: Option<LifecycleCommandValue>,
    pub post_start_command: Option<LifecycleCommandValue>,
    pub post_attach_command: Option<LifecycleCommandValue>,

    /// Last lifecycle hook the caller blocks on
    pub wait_for: Option<String>,

    pub customizations: Option<serde_json::Value>,
}

impl DevContainerConfig {
    /// Compose files, in declaration order
    pub fn compose_files(&self) -> Vec<String> {
        self.docker_compose_file
            .as_ref()
            .map(StringOrVec::to_vec)
            .unwrap_or_default()
    }

    pub fn uses_compose(&self) -> bool {
        !self.compose_files().is_empty()
    }

    /// True when a `build` section or a legacy `dockerFile` is present
    pub fn has_build(&self) -> bool {
        self.build.is_some() || self.dockerfile.is_some()
    }

    /// Dockerfile path relative to the configuration file directory
    pub fn dockerfile_path(&self) -> Option<String> {
        self.build
            .as_ref()
            .and_then(|b| b.dockerfile.clone())
            .or_else(|| self.dockerfile.clone())
    }

    /// Build context relative to the configuration file directory
    pub fn build_context(&self) -> String {
        self.build
            .as_ref()
            .and_then(|b| b.context.clone())
            .or_else(|| self.context.clone())
            .unwrap_or_else(|| ".".to_string())
    }

    /// Lifecycle commands keyed by hook point
    pub fn lifecycle_commands(&self) -> LifecycleCommands {
        LifecycleCommands {
            initialize: self.initialize_command.clone(),
            on_create: self.on_create_command.clone(),
            update_content: self.update_content_command.clone(),
            post_create: self.post_create_command.clone(),
            post_start: self.post_start_command.clone(),
            post_attach: self.post_attach_command.clone(),
        }
    }

    /// Replace lifecycle command fields
    pub fn set_lifecycle_commands(&mut self, commands: LifecycleCommands) {
        self.initialize_command = commands.get(LifecycleHook::Initialize).cloned();
        self.on_create_command = commands.get(LifecycleHook::OnCreate).cloned();
        self.update_content_command = commands.get(LifecycleHook::UpdateContent).cloned();
        self.post_create_command = commands.get(LifecycleHook::PostCreate).cloned();
        self.post_start_command = commands.get(LifecycleHook::PostStart).cloned();
        self.post_attach_command = commands.get(LifecycleHook::PostAttach).cloned();
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.image.is_some() && self.has_build() {
            return Err(ConfigError::Validation {
                message: format!(
                    "{}: cannot specify both 'image' and a Dockerfile build - choose one",
                    path.display()
                ),
            }
            .into());
        }
        if self.uses_compose() && self.service.is_none() {
            return Err(ConfigError::Validation {
                message: format!(
                    "{}: 'dockerComposeFile' requires a 'service'",
                    path.display()
                ),
            }
            .into());
        }
        if let Some(action) = &self.shutdown_action {
            if !matches!(action.as_str(), "none" | "stopContainer" | "stopCompose") {
                return Err(ConfigError::Validation {
                    message: format!("Invalid shutdownAction '{}'", action),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// A loaded configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConfig {
    /// Typed configuration
    pub config: DevContainerConfig,
    /// The document as parsed, comments removed
    ///
    /// Hashing canonicalizes this after variable substitution.
    pub raw: serde_json::Value,
}

impl ParsedConfig {
    /// Parse JSON-with-comments text
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let raw: serde_json::Value = json5::from_str(content).map_err(|e| ConfigError::Parsing {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_value(raw, path)
    }

    /// Build from an already parsed document
    pub fn from_value(raw: serde_json::Value, path: &Path) -> Result<Self> {
        if !raw.is_object() {
            return Err(ConfigError::Validation {
                message: format!(
                    "Configuration ({}) must contain a JSON object literal",
                    path.display()
                ),
            }
            .into());
        }

        let config: DevContainerConfig =
            serde_json::from_value(raw.clone()).map_err(|e| ConfigError::Parsing {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate(path)?;

        Ok(Self { config, raw })
    }
}

/// Where configuration comes from
pub trait ConfigSource: Send + Sync {
    /// Load the configuration for a workspace
    ///
    /// Returns the parsed configuration and the path it was loaded from.
    fn load(
        &self,
        workspace_root: &Path,
        explicit_path: Option<&Path>,
    ) -> Result<(ParsedConfig, PathBuf)>;
}

/// Loads configuration files from disk
#[derive(Debug, Default, Clone, Copy)]
pub struct FileConfigSource;

impl FileConfigSource {
    pub fn new() -> Self {
        Self
    }

    /// Locate the configuration file for a workspace
    #[instrument(skip_all, fields(workspace = %workspace.display()))]
    pub fn discover(workspace: &Path) -> Result<PathBuf> {
        if !workspace.exists() {
            return Err(ConfigError::NotFound {
                path: workspace.display().to_string(),
            }
            .into());
        }

        let devcontainer_dir = workspace.join(".devcontainer");
        if let Some(path) = check_config_file(&devcontainer_dir) {
            debug!("Found config: {}", path.display());
            return Ok(path);
        }

        for name in [".devcontainer.json", ".devcontainer.jsonc"] {
            let path = workspace.join(name);
            if path.is_file() {
                debug!("Found config: {}", path.display());
                return Ok(path);
            }
        }

        let mut named = enumerate_named_configs(&devcontainer_dir)?;
        match named.len() {
            0 => Err(ConfigError::NotFound {
                path: devcontainer_dir.join("devcontainer.json").display().to_string(),
            }
            .into()),
            1 => Ok(named.remove(0)),
            _ => Err(ConfigError::MultipleConfigs {
                paths: named.iter().map(|p| p.display().to_string()).collect(),
            }
            .into()),
        }
    }

    /// Read and parse one file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load_from_path(path: &Path) -> Result<ParsedConfig> {
        if !path.is_file() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let parsed = ParsedConfig::parse(&content, path)?;
        debug!(
            "Loaded configuration with name: {:?}",
            parsed.config.name
        );
        Ok(parsed)
    }
}

impl ConfigSource for FileConfigSource {
    fn load(
        &self,
        workspace_root: &Path,
        explicit_path: Option<&Path>,
    ) -> Result<(ParsedConfig, PathBuf)> {
        let path = match explicit_path {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => workspace_root.join(p),
            None => Self::discover(workspace_root)?,
        };
        let parsed = Self::load_from_path(&path)?;
        Ok((parsed, path))
    }
}

fn check_config_file(dir: &Path) -> Option<PathBuf> {
    ["devcontainer.json", "devcontainer.jsonc"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Named config folders directly under `.devcontainer/`, sorted by folder name
fn enumerate_named_configs(devcontainer_dir: &Path) -> Result<Vec<PathBuf>> {
    if !devcontainer_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut subdirs: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(devcontainer_dir).map_err(ConfigError::Io)? {
        let entry = entry.map_err(ConfigError::Io)?;
        if !entry.file_type().map_err(ConfigError::Io)?.is_dir() {
            continue;
        }
        if let Some(config_path) = check_config_file(&entry.path()) {
            subdirs.push((entry.file_name().to_string_lossy().into_owned(), config_path));
        }
    }
    subdirs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(subdirs.into_iter().map(|(_, path)| path).collect())
}
