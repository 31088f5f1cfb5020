//! Deterministic content hashing
//!
//! Every input that should trigger a rebuild is reduced to a hex SHA-256
//! digest. JSON inputs are serialized canonically (keys sorted recursively, no
//! insignificant whitespace) so that key order and formatting never affect a
//! digest. The overall hash is the digest of the four fragment digests
//! concatenated, with absent fragments contributing the empty string.

use crate::errors::{HashError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Version of the hashing scheme
///
/// Bumping it changes every configuration hash, which marks all existing
/// containers stale.
pub const HASH_SCHEMA_VERSION: u32 = 1;

/// Hex SHA-256 of a byte slice
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compact JSON with object keys sorted recursively
pub fn canonical_json(value: &Value) -> String {
    let mut value = value.clone();
    canonicalize_json(&mut value);
    value.to_string()
}

fn canonicalize_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .iter_mut()
                .map(|(k, v)| (k.clone(), std::mem::take(v)))
                .collect();
            map.clear();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, mut val) in entries {
                canonicalize_json(&mut val);
                map.insert(key, val);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize_json(item);
            }
        }
        _ => {}
    }
}

fn to_canonical<T: Serialize + ?Sized>(fragment: &str, value: &T) -> Result<String> {
    let value = serde_json::to_value(value).map_err(|e| HashError::Serialization {
        fragment: fragment.to_string(),
        message: e.to_string(),
    })?;
    Ok(canonical_json(&value))
}

/// Digest of the configuration record
///
/// The record holds the schema version, the comment-stripped configuration
/// bytes, the declared features and, when given, compose file contents keyed
/// by relative path and the Dockerfile content.
pub fn hash_canonical_config<F: Serialize + ?Sized>(
    raw_config: &[u8],
    schema_version: u32,
    features: &F,
    compose_contents: Option<&BTreeMap<String, String>>,
    dockerfile_content: Option<&str>,
) -> Result<String> {
    let features = serde_json::to_value(features).map_err(|e| HashError::Serialization {
        fragment: "features".to_string(),
        message: e.to_string(),
    })?;
    let record = json!({
        "schemaVersion": schema_version,
        "config": String::from_utf8_lossy(raw_config),
        "features": features,
        "compose": compose_contents,
        "dockerfile": dockerfile_content,
    });
    Ok(hash_bytes(canonical_json(&record).as_bytes()))
}

/// Identity of one resolved feature, as far as hashing is concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFingerprint {
    pub id: String,
    pub digest: String,
    pub options: Value,
}

/// Digest of a feature set, independent of declaration order
pub fn hash_feature_list(features: &[FeatureFingerprint]) -> Result<String> {
    let mut tuples = features
        .iter()
        .map(|f| {
            let options = to_canonical(&format!("options of feature {}", f.id), &f.options)?;
            Ok(format!("{}:{}:{}", f.id, f.digest, options))
        })
        .collect::<Result<Vec<String>>>()?;
    tuples.sort();
    Ok(hash_bytes(tuples.join("\n").as_bytes()))
}

/// Inputs to [`ContentHashes::compute`]
#[derive(Debug, Clone, Copy)]
pub struct HashInputs<'a> {
    /// Canonical configuration bytes (post substitution)
    pub raw_config: &'a [u8],
    /// Declared feature map
    pub declared_features: &'a Value,
    /// Dockerfile content for Dockerfile plans
    pub dockerfile: Option<&'a str>,
    /// Compose file contents keyed by relative path
    pub compose: &'a BTreeMap<String, String>,
    /// Resolved features
    pub features: &'a [FeatureFingerprint],
}

/// The content hash set of a workspace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHashes {
    pub config: String,
    pub dockerfile: String,
    pub compose: String,
    pub features: String,
    pub overall: String,
}

impl ContentHashes {
    /// Hash every fragment and derive the overall digest
    ///
    /// The config fragment is computed without compose or Dockerfile content
    /// so each fragment changes only with its own input.
    pub fn compute(inputs: &HashInputs<'_>) -> Result<Self> {
        let config = hash_canonical_config(
            inputs.raw_config,
            HASH_SCHEMA_VERSION,
            inputs.declared_features,
            None,
            None,
        )?;
        let dockerfile = inputs
            .dockerfile
            .map(|content| hash_bytes(content.as_bytes()))
            .unwrap_or_default();
        let compose = if inputs.compose.is_empty() {
            String::new()
        } else {
            hash_bytes(to_canonical("compose files", inputs.compose)?.as_bytes())
        };
        let features = if inputs.features.is_empty() {
            String::new()
        } else {
            hash_feature_list(inputs.features)?
        };
        Ok(Self::from_fragments(config, dockerfile, compose, features))
    }

    /// Assemble from fragment digests, deriving `overall`
    pub fn from_fragments(
        config: String,
        dockerfile: String,
        compose: String,
        features: String,
    ) -> Self {
        let overall = hash_bytes(format!("{}{}{}{}", config, dockerfile, compose, features).as_bytes());
        Self {
            config,
            dockerfile,
            compose,
            features,
            overall,
        }
    }

    /// Human-readable list of fragments that differ from `recorded`
    pub fn changed_fragments(&self, recorded: &ContentHashes) -> Vec<String> {
        let mut changed = Vec::new();
        if self.config != recorded.config {
            changed.push("devcontainer.json changed".to_string());
        }
        if self.dockerfile != recorded.dockerfile {
            changed.push("Dockerfile changed".to_string());
        }
        if self.compose != recorded.compose {
            changed.push("docker-compose files changed".to_string());
        }
        if self.features != recorded.features {
            changed.push("features changed".to_string());
        }
        if changed.is_empty() && self.overall != recorded.overall {
            changed.push("content hash changed".to_string());
        }
        changed
    }
}
