//! Error types and handling
//!
//! The taxonomy is split by kind: configuration, feature, lifecycle, build,
//! state, runtime and hashing errors. Each domain enum is wrapped by
//! [`StevedoreError`], which also carries the pipeline stage a failure
//! originated from so callers never see a bare generic message.

use crate::progress::PipelineStage;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },

    /// Configuration file parsing error
    #[error("Failed to parse configuration file {path}: {message}")]
    Parsing { path: String, message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// None of image, build or dockerComposeFile is declared
    #[error("Configuration {path} declares no image, build or dockerComposeFile")]
    MissingPlan { path: String },

    /// Multiple named configurations found and none selected explicitly
    #[error("Multiple configurations found, select one explicitly:\n{}",
        paths.iter().map(|p| format!("  {}", p)).collect::<Vec<_>>().join("\n"))]
    MultipleConfigs { paths: Vec<String> },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
}

/// Feature-related errors
#[derive(Error, Debug)]
pub enum FeatureError {
    /// Feature reference could not be found
    #[error("Feature not found: {feature}")]
    NotFound { feature: String },

    /// Feature resolution failed for a specific feature
    #[error("Failed to resolve feature {feature}: {message}")]
    Resolution { feature: String, message: String },

    /// Feature dependency cycle detected
    #[error("Dependency cycle detected in features: {cycle_path}")]
    DependencyCycle { cycle_path: String },

    /// Feature metadata parsing error
    #[error("Failed to parse metadata for feature {feature}: {message}")]
    Metadata { feature: String, message: String },

    /// overrideFeatureInstallOrder names a feature that is not declared
    #[error("Feature '{feature}' in overrideFeatureInstallOrder is not declared")]
    UnknownOverride { feature: String },

    /// Feature option values could not be serialized
    #[error("Failed to serialize options for feature {feature}: {message}")]
    Serialization { feature: String, message: String },
}

/// Lifecycle hook execution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    /// A hook command exited non-zero
    #[error("{hook} failed with exit code {exit_code}: {command}")]
    HookFailed {
        hook: String,
        exit_code: i32,
        command: String,
    },

    /// The hook command could not be executed at all
    #[error("{hook} could not be executed: {message}")]
    Exec { hook: String, message: String },

    /// The hook exceeded its time budget
    #[error("{hook} timed out after {seconds}s")]
    Timeout { hook: String, seconds: u64 },

    /// The hook was aborted through cancellation
    #[error("{hook} was cancelled")]
    Cancelled { hook: String },
}

impl LifecycleError {
    /// Name of the hook the error is attributed to
    pub fn hook(&self) -> &str {
        match self {
            LifecycleError::HookFailed { hook, .. }
            | LifecycleError::Exec { hook, .. }
            | LifecycleError::Timeout { hook, .. }
            | LifecycleError::Cancelled { hook } => hook,
        }
    }
}

/// Image build errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// Base image pull failed
    #[error("Failed to pull image {image}: {message}")]
    Pull { image: String, message: String },

    /// Image build failed
    #[error("Failed to build image {image}: {message}")]
    Build { image: String, message: String },

    /// Build context directory does not exist
    #[error("Build context not found: {path}")]
    MissingBuildContext { path: String },
}

/// Runtime state inspection errors (distinct from absence)
#[derive(Error, Debug)]
pub enum StateError {
    /// Listing or inspecting resources failed
    #[error("Failed to inspect state of workspace {workspace_id}: {message}")]
    Inspection {
        workspace_id: String,
        message: String,
    },
}

/// Container engine client errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime binary is not installed or not accessible
    #[error("Container runtime '{runtime}' is not installed or not accessible")]
    NotInstalled { runtime: String },

    /// An engine operation failed
    #[error("Container engine {operation} failed: {message}")]
    Engine { operation: String, message: String },

    /// Container not found
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },
}

/// Content hashing errors
#[derive(Error, Debug)]
pub enum HashError {
    /// A fragment could not be serialized into its canonical form
    #[error("Failed to serialize {fragment} for hashing: {message}")]
    Serialization { fragment: String, message: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum StevedoreError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Feature-related errors
    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),

    /// Lifecycle hook errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Image build errors
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// State inspection errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Container engine errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Hashing errors
    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    /// A pipeline stage failed
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<StevedoreError>,
    },
}

impl StevedoreError {
    /// Attribute this error to a pipeline stage
    ///
    /// Errors that already carry a stage are returned unchanged.
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            StevedoreError::Stage { .. } => self,
            other => StevedoreError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was attributed to, if any
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            StevedoreError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The innermost error, skipping stage attribution
    pub fn root(&self) -> &StevedoreError {
        match self {
            StevedoreError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Convenience type alias for Results with StevedoreError
pub type Result<T> = std::result::Result<T, StevedoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::MissingPlan {
            path: "/ws/.devcontainer/devcontainer.json".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration /ws/.devcontainer/devcontainer.json declares no image, build or dockerComposeFile"
        );

        let error = ConfigError::MultipleConfigs {
            paths: vec![
                ".devcontainer/node/devcontainer.json".to_string(),
                ".devcontainer/python/devcontainer.json".to_string(),
            ],
        };
        assert_eq!(
            format!("{}", error),
            "Multiple configurations found, select one explicitly:\n  .devcontainer/node/devcontainer.json\n  .devcontainer/python/devcontainer.json"
        );
    }

    #[test]
    fn test_feature_cycle_carries_path() {
        let error = FeatureError::DependencyCycle {
            cycle_path: "a -> b -> a".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Dependency cycle detected in features: a -> b -> a"
        );
    }

    #[test]
    fn test_lifecycle_error_names_hook() {
        let error = LifecycleError::HookFailed {
            hook: "onCreateCommand".to_string(),
            exit_code: 2,
            command: "make setup".to_string(),
        };
        assert_eq!(error.hook(), "onCreateCommand");
        assert_eq!(
            format!("{}", error),
            "onCreateCommand failed with exit code 2: make setup"
        );
    }

    #[test]
    fn test_stage_attribution() {
        let error: StevedoreError = BuildError::Build {
            image: "stevedore-abc".to_string(),
            message: "exit status 1".to_string(),
        }
        .into();
        let staged = error.in_stage(PipelineStage::Build);
        assert_eq!(staged.stage(), Some(PipelineStage::Build));
        assert!(staged.to_string().starts_with("build stage failed"));
        assert!(matches!(staged.root(), StevedoreError::Build(_)));

        // Re-attributing keeps the original stage
        let restaged = staged.in_stage(PipelineStage::Deploy);
        assert_eq!(restaged.stage(), Some(PipelineStage::Build));
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let error = StevedoreError::Config(ConfigError::Io(io_error));
        assert!(error.source().is_some());
        if let Some(source) = error.source() {
            assert!(source.source().is_some());
        }
    }

    #[test]
    fn test_anyhow_conversions() {
        let error = StevedoreError::Runtime(RuntimeError::NotInstalled {
            runtime: "docker".to_string(),
        });
        let anyhow_error = anyhow::Error::from(error);
        assert!(anyhow_error.to_string().contains("Runtime error"));
    }
}
