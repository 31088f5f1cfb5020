//! Feature layer generation
//!
//! Features are installed into a derived image. The generated Dockerfile
//! copies each feature directory into the build context and runs its
//! `install.sh` after sourcing an env file that exports the feature options
//! as upper-cased variables, one layer per feature, in installation order.
//! Option values never appear in the Dockerfile itself.

use crate::errors::{BuildError, Result};
use crate::features::ResolvedFeature;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Where feature directories are copied inside the image
pub const FEATURES_DIR: &str = "/tmp/stevedore-features";

const BASE_IMAGE_ARG: &str = "_STEVEDORE_BASE_IMAGE";

/// Options file written next to each feature's `install.sh`
pub const OPTIONS_ENV_FILE: &str = "stevedore-feature-options.env";

pub struct FeatureLayerDockerfile;

impl FeatureLayerDockerfile {
    /// Dockerfile installing `features` on top of `base_image`
    pub fn generate(base_image: &str, features: &[ResolvedFeature]) -> String {
        let mut dockerfile = format!(
            "ARG {arg}={base}\nFROM ${{{arg}}}\n\nUSER root\nRUN mkdir -p {dir}\n\n",
            arg = BASE_IMAGE_ARG,
            base = base_image,
            dir = FEATURES_DIR
        );

        for (index, feature) in features.iter().enumerate() {
            let dir_name = Self::feature_dir_name(feature, index);
            let target = format!("{}/{}", FEATURES_DIR, dir_name);
            dockerfile.push_str(&format!("# {}\n", feature.id));
            dockerfile.push_str(&format!("COPY {}/ {}/\n", dir_name, target));
            dockerfile.push_str(&format!(
                "RUN cd {} \\\n    && chmod +x install.sh \\\n    && . ./{} \\\n    && ./install.sh\n\n",
                target, OPTIONS_ENV_FILE
            ));
        }
        dockerfile
    }

    /// Directory name of a feature inside the build context
    pub fn feature_dir_name(feature: &ResolvedFeature, index: usize) -> String {
        let sanitized: String = feature
            .id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", sanitized, index)
    }

    /// Options as environment variables, sorted by name
    pub fn option_env(options: &Value) -> BTreeMap<String, String> {
        let Some(map) = options.as_object() else {
            return BTreeMap::new();
        };
        map.iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (option_env_name(key), value)
            })
            .collect()
    }

    /// Shell script exporting the options, each value single-quoted
    pub fn options_script(options: &Value) -> String {
        let mut script = String::from("# Feature options\n");
        for (key, value) in Self::option_env(options) {
            script.push_str(&format!("export {}={}\n", key, single_quote(&value)));
        }
        script
    }

    /// Populate `context_dir` with the feature directories and the Dockerfile
    ///
    /// Returns the path of the written Dockerfile.
    #[instrument(skip(features), fields(context = %context_dir.display()))]
    pub fn prepare_context(
        context_dir: &Path,
        base_image: &str,
        features: &[ResolvedFeature],
    ) -> Result<PathBuf> {
        let io_error = |e: std::io::Error| BuildError::Build {
            image: base_image.to_string(),
            message: format!(
                "failed to prepare feature context {}: {}",
                context_dir.display(),
                e
            ),
        };

        if context_dir.exists() {
            std::fs::remove_dir_all(context_dir).map_err(io_error)?;
        }
        std::fs::create_dir_all(context_dir).map_err(io_error)?;
        for (index, feature) in features.iter().enumerate() {
            let target = context_dir.join(Self::feature_dir_name(feature, index));
            copy_dir(&feature.local_path, &target).map_err(io_error)?;
            std::fs::write(
                target.join(OPTIONS_ENV_FILE),
                Self::options_script(&feature.options),
            )
            .map_err(io_error)?;
        }

        let dockerfile = context_dir.join("Dockerfile");
        std::fs::write(&dockerfile, Self::generate(base_image, features)).map_err(io_error)?;
        debug!(
            "Prepared feature context with {} feature(s)",
            features.len()
        );
        Ok(dockerfile)
    }
}

/// Upper-case, non-alphanumerics replaced, never starting with a digit
fn option_env_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Quote for POSIX sh; nothing inside single quotes is interpreted
fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureMetadata;
    use serde_json::json;
    use tempfile::TempDir;

    fn feature(id: &str, path: PathBuf, options: Value) -> ResolvedFeature {
        ResolvedFeature {
            id: id.to_string(),
            reference: format!("./{}", id),
            local_path: path,
            digest: format!("sha256:{}", id),
            options,
            metadata: FeatureMetadata::default(),
            install_order: 0,
        }
    }

    #[test]
    fn test_option_env_names() {
        assert_eq!(option_env_name("version"), "VERSION");
        assert_eq!(option_env_name("install-tools"), "INSTALL_TOOLS");
        assert_eq!(option_env_name("3d"), "_3D");
    }

    #[test]
    fn test_generate_in_installation_order() {
        let features = vec![
            feature("common-utils", PathBuf::from("a"), json!({"zsh": true})),
            feature("node", PathBuf::from("b"), json!({"version": "18", "say": "a \"b\""})),
        ];
        let dockerfile = FeatureLayerDockerfile::generate("alpine:3.19", &features);

        assert!(dockerfile.starts_with("ARG _STEVEDORE_BASE_IMAGE=alpine:3.19\n"));
        let first = dockerfile.find("COPY common-utils_0/").unwrap();
        let second = dockerfile.find("COPY node_1/").unwrap();
        assert!(first < second);
        assert!(dockerfile.contains("&& . ./stevedore-feature-options.env \\\n    && ./install.sh"));
        assert!(!dockerfile.contains("VERSION"));
    }

    #[test]
    fn test_options_script_quotes_values() {
        let script = FeatureLayerDockerfile::options_script(&json!({
            "version": "18",
            "say": "it's",
            "zsh": true
        }));
        assert!(script.contains("export SAY='it'\"'\"'s'\n"));
        assert!(script.contains("export VERSION='18'\n"));
        assert!(script.contains("export ZSH='true'\n"));
    }

    #[test]
    fn test_hostile_option_values_stay_out_of_dockerfile() {
        let hostile = "a`id`b\nRUN rm -rf /";
        let features = vec![feature("greeter", PathBuf::from("a"), json!({"greeting": hostile}))];
        let dockerfile = FeatureLayerDockerfile::generate("alpine", &features);
        assert!(!dockerfile.contains("`id`"));
        assert!(!dockerfile.lines().any(|l| l.starts_with("RUN rm")));

        let script = FeatureLayerDockerfile::options_script(&features[0].options);
        assert!(script.contains("export GREETING='a`id`b\nRUN rm -rf /'\n"));
    }

    #[test]
    fn test_prepare_context_copies_features() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("src/node");
        std::fs::create_dir_all(source.join("lib"))?;
        std::fs::write(source.join("install.sh"), "#!/bin/sh\n")?;
        std::fs::write(source.join("lib/helper.sh"), "true\n")?;

        let context = temp.path().join("ctx");
        let features = vec![feature("node", source, json!({}))];
        let dockerfile = FeatureLayerDockerfile::prepare_context(&context, "alpine", &features)?;

        assert_eq!(dockerfile, context.join("Dockerfile"));
        assert!(context.join("node_0/install.sh").exists());
        assert!(context.join("node_0/lib/helper.sh").exists());
        assert!(context.join("node_0").join(OPTIONS_ENV_FILE).exists());
        Ok(())
    }
}
