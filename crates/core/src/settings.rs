//! Engine settings
//!
//! Defaults can be overlaid from the environment with
//! [`EngineSettings::from_env`]. Invalid values keep the default and log a
//! warning.

use crate::lifecycle::{LifecycleHook, WaitFor};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Container runtime binary
pub const ENV_RUNTIME: &str = "STEVEDORE_RUNTIME";

/// Default wait-for point, as a hook key
pub const ENV_WAIT_FOR: &str = "STEVEDORE_WAIT_FOR";

/// Per-hook timeout for background hooks, in seconds (0 disables)
pub const ENV_HOOK_TIMEOUT: &str = "STEVEDORE_HOOK_TIMEOUT_SECS";

/// Namespace of every label the engine writes
pub const LABEL_NAMESPACE: &str = "dev.stevedore";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Wait-for point used when the configuration does not declare one
    pub wait_for: LifecycleHook,
    /// Container runtime binary (`docker`, `podman`)
    pub runtime_path: String,
    /// Time budget of each background hook; `None`, the default, lets
    /// background hooks run to completion
    #[serde(with = "optional_secs")]
    pub background_hook_timeout: Option<Duration>,
    /// Pass `--no-cache` to image builds
    pub build_no_cache: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            wait_for: WaitFor::DEFAULT.hook(),
            runtime_path: "docker".to_string(),
            background_hook_timeout: None,
            build_no_cache: false,
        }
    }
}

impl EngineSettings {
    /// Defaults overlaid with `STEVEDORE_*` environment variables
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(runtime) = lookup(ENV_RUNTIME).filter(|v| !v.trim().is_empty()) {
            self.runtime_path = runtime.trim().to_string();
        }
        if let Some(value) = lookup(ENV_WAIT_FOR) {
            match LifecycleHook::from_config_key(value.trim()) {
                Some(hook) => self.wait_for = hook,
                None => warn!("Ignoring invalid {}='{}'", ENV_WAIT_FOR, value),
            }
        }
        if let Some(value) = lookup(ENV_HOOK_TIMEOUT) {
            match value.trim().parse::<u64>() {
                Ok(0) => self.background_hook_timeout = None,
                Ok(secs) => self.background_hook_timeout = Some(Duration::from_secs(secs)),
                Err(_) => warn!("Ignoring invalid {}='{}'", ENV_HOOK_TIMEOUT, value),
            }
        }
        self
    }

    /// Effective wait-for point: the configured value wins over the default
    pub fn wait_for(&self, configured: Option<&str>) -> WaitFor {
        match configured {
            Some(_) => WaitFor::parse(configured),
            None => WaitFor::new(self.wait_for),
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overlay(vars: &[(&str, &str)]) -> EngineSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineSettings::default().overlay(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.wait_for, LifecycleHook::UpdateContent);
        assert_eq!(settings.runtime_path, "docker");
        assert_eq!(settings.background_hook_timeout, None);
        assert!(!settings.build_no_cache);
    }

    #[test]
    fn test_env_overlay() {
        let settings = overlay(&[
            (ENV_RUNTIME, "podman"),
            (ENV_WAIT_FOR, "postCreateCommand"),
            (ENV_HOOK_TIMEOUT, "45"),
        ]);
        assert_eq!(settings.runtime_path, "podman");
        assert_eq!(settings.wait_for, LifecycleHook::PostCreate);
        assert_eq!(settings.background_hook_timeout, Some(Duration::from_secs(45)));

        assert_eq!(overlay(&[(ENV_HOOK_TIMEOUT, "0")]).background_hook_timeout, None);
    }

    #[test]
    fn test_invalid_env_values_keep_defaults() {
        let settings = overlay(&[(ENV_WAIT_FOR, "later"), (ENV_HOOK_TIMEOUT, "soon")]);
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_configured_wait_for_wins() {
        let settings = overlay(&[(ENV_WAIT_FOR, "postStartCommand")]);
        assert_eq!(settings.wait_for(None).hook(), LifecycleHook::PostStart);
        assert_eq!(
            settings.wait_for(Some("onCreateCommand")).hook(),
            LifecycleHook::OnCreate
        );
        assert_eq!(
            settings.wait_for(Some("nonsense")).hook(),
            LifecycleHook::UpdateContent
        );
    }

    #[test]
    fn test_settings_deserialize_partial() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"runtimePath": "podman", "backgroundHookTimeout": 30}"#)
                .unwrap();
        assert_eq!(settings.runtime_path, "podman");
        assert_eq!(settings.background_hook_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.wait_for, LifecycleHook::UpdateContent);
    }
}
