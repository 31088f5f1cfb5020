//! Lifecycle hook points and command shapes
//!
//! Hook points form a strict total order:
//! initialize < onCreate < updateContent < postCreate < postStart < postAttach.
//! A wait-for point splits the create-time sequence into a blocking prefix and a
//! background suffix (see [`crate::hooks`]).
//!
//! Commands are decoded once from configuration JSON into
//! [`LifecycleCommandValue`] and never re-inspected as raw JSON afterwards.

use crate::errors::{ConfigError, Result};
use crate::variable::{Substitute, SubstitutionContext, SubstitutionReport};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Lifecycle hook points in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleHook {
    /// Host-side initialization, before anything touches the container
    Initialize,
    /// First start of a freshly created container
    OnCreate,
    /// Content synchronization
    UpdateContent,
    /// Post-creation configuration
    PostCreate,
    /// Every container start
    PostStart,
    /// Every attach of a tool
    PostAttach,
}

impl LifecycleHook {
    /// Position in the total order
    pub fn order_index(&self) -> usize {
        match self {
            LifecycleHook::Initialize => 0,
            LifecycleHook::OnCreate => 1,
            LifecycleHook::UpdateContent => 2,
            LifecycleHook::PostCreate => 3,
            LifecycleHook::PostStart => 4,
            LifecycleHook::PostAttach => 5,
        }
    }

    /// The configuration key that declares this hook
    pub fn config_key(&self) -> &'static str {
        match self {
            LifecycleHook::Initialize => "initializeCommand",
            LifecycleHook::OnCreate => "onCreateCommand",
            LifecycleHook::UpdateContent => "updateContentCommand",
            LifecycleHook::PostCreate => "postCreateCommand",
            LifecycleHook::PostStart => "postStartCommand",
            LifecycleHook::PostAttach => "postAttachCommand",
        }
    }

    /// Parse a configuration key (`onCreateCommand`) or short name (`onCreate`)
    pub fn from_config_key(key: &str) -> Option<Self> {
        let hook = match key {
            "initializeCommand" | "initialize" => LifecycleHook::Initialize,
            "onCreateCommand" | "onCreate" => LifecycleHook::OnCreate,
            "updateContentCommand" | "updateContent" => LifecycleHook::UpdateContent,
            "postCreateCommand" | "postCreate" => LifecycleHook::PostCreate,
            "postStartCommand" | "postStart" => LifecycleHook::PostStart,
            "postAttachCommand" | "postAttach" => LifecycleHook::PostAttach,
            _ => return None,
        };
        Some(hook)
    }

    /// Hooks run when a container is created, in order
    pub fn create_sequence() -> &'static [LifecycleHook] {
        &[
            LifecycleHook::Initialize,
            LifecycleHook::OnCreate,
            LifecycleHook::UpdateContent,
            LifecycleHook::PostCreate,
            LifecycleHook::PostStart,
        ]
    }

    /// Whether the hook runs on the host rather than inside the container
    pub fn is_host_side(&self) -> bool {
        matches!(self, LifecycleHook::Initialize)
    }

    /// Whether features may contribute commands for this hook
    pub fn accepts_feature_commands(&self) -> bool {
        !self.is_host_side()
    }
}

impl fmt::Display for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// The last hook point the caller blocks on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFor(LifecycleHook);

impl WaitFor {
    /// Default cutoff: the caller waits through updateContentCommand
    pub const DEFAULT: WaitFor = WaitFor(LifecycleHook::UpdateContent);

    pub fn new(hook: LifecycleHook) -> Self {
        Self(hook)
    }

    /// Parse a configured wait-for value, falling back to the default
    ///
    /// Unrecognized values are not an error.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None => Self::DEFAULT,
            Some(raw) => match LifecycleHook::from_config_key(raw) {
                Some(hook) => Self(hook),
                None => {
                    warn!(
                        "Unrecognized waitFor value '{}', using {}",
                        raw,
                        Self::DEFAULT.hook()
                    );
                    Self::DEFAULT
                }
            },
        }
    }

    pub fn hook(&self) -> LifecycleHook {
        self.0
    }

    /// Order index of the cutoff
    pub fn index(&self) -> usize {
        self.0.order_index()
    }

    /// Whether `hook` belongs to the blocking prefix
    pub fn blocks(&self, hook: LifecycleHook) -> bool {
        hook.order_index() <= self.index()
    }
}

impl Default for WaitFor {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A lifecycle command in one of its three shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommandValue {
    /// Single string, run through `sh -c`
    Shell(String),
    /// Argument vector, run directly with no shell and no re-splitting
    Exec(Vec<String>),
    /// Named commands, each of its own shape, run concurrently
    Parallel(IndexMap<String, LifecycleCommandValue>),
}

impl LifecycleCommandValue {
    /// Decode a JSON value into a command
    ///
    /// Returns `Ok(None)` for `null`. Inside a named map, entries that are
    /// neither a string nor an array are skipped with a warning; at the top
    /// level they are a validation error.
    pub fn from_json_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(LifecycleCommandValue::Shell(s.clone()))),
            Value::Array(items) => Ok(Some(LifecycleCommandValue::Exec(Self::exec_args(
                items,
            )?))),
            Value::Object(map) => {
                let mut entries = IndexMap::new();
                for (name, entry) in map {
                    match entry {
                        Value::String(s) => {
                            entries.insert(name.clone(), LifecycleCommandValue::Shell(s.clone()));
                        }
                        Value::Array(items) => {
                            entries.insert(
                                name.clone(),
                                LifecycleCommandValue::Exec(Self::exec_args(items)?),
                            );
                        }
                        Value::Null => {
                            debug!("Skipping null lifecycle command entry '{}'", name);
                        }
                        other => {
                            warn!(
                                "Skipping lifecycle command entry '{}' with unsupported type: {}",
                                name, other
                            );
                        }
                    }
                }
                Ok(Some(LifecycleCommandValue::Parallel(entries)))
            }
            other => Err(ConfigError::Validation {
                message: format!(
                    "Lifecycle command must be a string, array or object, got: {}",
                    other
                ),
            }
            .into()),
        }
    }

    fn exec_args(items: &[Value]) -> Result<Vec<String>> {
        items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(ConfigError::Validation {
                    message: format!(
                        "Lifecycle command array elements must be strings, got: {}",
                        other
                    ),
                }
                .into()),
            })
            .collect()
    }

    /// Back to the JSON shape it was decoded from
    pub fn to_json_value(&self) -> Value {
        match self {
            LifecycleCommandValue::Shell(s) => Value::String(s.clone()),
            LifecycleCommandValue::Exec(args) => {
                Value::Array(args.iter().cloned().map(Value::String).collect())
            }
            LifecycleCommandValue::Parallel(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_value()))
                    .collect(),
            ),
        }
    }

    /// True when there is nothing to run
    pub fn is_empty(&self) -> bool {
        match self {
            LifecycleCommandValue::Shell(s) => s.trim().is_empty(),
            LifecycleCommandValue::Exec(args) => args.is_empty(),
            LifecycleCommandValue::Parallel(map) => map.values().all(|v| v.is_empty()),
        }
    }

    /// Apply variable substitution; array commands are substituted element-wise
    pub fn substitute(
        &self,
        registry: &dyn Substitute,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> Self {
        match self {
            LifecycleCommandValue::Shell(s) => {
                LifecycleCommandValue::Shell(registry.substitute(s, context, report))
            }
            LifecycleCommandValue::Exec(args) => LifecycleCommandValue::Exec(
                args.iter()
                    .map(|arg| registry.substitute(arg, context, report))
                    .collect(),
            ),
            LifecycleCommandValue::Parallel(map) => LifecycleCommandValue::Parallel(
                map.iter()
                    .map(|(name, cmd)| (name.clone(), cmd.substitute(registry, context, report)))
                    .collect(),
            ),
        }
    }

    /// Human-readable rendering for logs and error messages
    pub fn display(&self) -> String {
        match self {
            LifecycleCommandValue::Shell(s) => s.clone(),
            LifecycleCommandValue::Exec(args) => shell_words::join(args),
            LifecycleCommandValue::Parallel(map) => map
                .iter()
                .map(|(name, cmd)| format!("{}: {}", name, cmd.display()))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

impl Serialize for LifecycleCommandValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LifecycleCommandValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        LifecycleCommandValue::from_json_value(&value)
            .map_err(serde::de::Error::custom)?
            .ok_or_else(|| serde::de::Error::custom("lifecycle command cannot be null"))
    }
}

/// Lifecycle commands declared by one source (the configuration or a feature)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleCommands {
    pub initialize: Option<LifecycleCommandValue>,
    pub on_create: Option<LifecycleCommandValue>,
    pub update_content: Option<LifecycleCommandValue>,
    pub post_create: Option<LifecycleCommandValue>,
    pub post_start: Option<LifecycleCommandValue>,
    pub post_attach: Option<LifecycleCommandValue>,
}

impl LifecycleCommands {
    /// Command declared for a hook point
    pub fn get(&self, hook: LifecycleHook) -> Option<&LifecycleCommandValue> {
        match hook {
            LifecycleHook::Initialize => self.initialize.as_ref(),
            LifecycleHook::OnCreate => self.on_create.as_ref(),
            LifecycleHook::UpdateContent => self.update_content.as_ref(),
            LifecycleHook::PostCreate => self.post_create.as_ref(),
            LifecycleHook::PostStart => self.post_start.as_ref(),
            LifecycleHook::PostAttach => self.post_attach.as_ref(),
        }
    }

    pub fn set(&mut self, hook: LifecycleHook, command: Option<LifecycleCommandValue>) {
        let slot = match hook {
            LifecycleHook::Initialize => &mut self.initialize,
            LifecycleHook::OnCreate => &mut self.on_create,
            LifecycleHook::UpdateContent => &mut self.update_content,
            LifecycleHook::PostCreate => &mut self.post_create,
            LifecycleHook::PostStart => &mut self.post_start,
            LifecycleHook::PostAttach => &mut self.post_attach,
        };
        *slot = command;
    }

    pub fn with(mut self, hook: LifecycleHook, command: LifecycleCommandValue) -> Self {
        self.set(hook, Some(command));
        self
    }

    pub fn is_empty(&self) -> bool {
        [
            LifecycleHook::Initialize,
            LifecycleHook::OnCreate,
            LifecycleHook::UpdateContent,
            LifecycleHook::PostCreate,
            LifecycleHook::PostStart,
            LifecycleHook::PostAttach,
        ]
        .iter()
        .all(|hook| self.get(*hook).map_or(true, |c| c.is_empty()))
    }

    /// Substitute variables in every declared command
    pub fn substitute(
        &self,
        registry: &dyn Substitute,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> Self {
        let sub = |c: &Option<LifecycleCommandValue>, report: &mut SubstitutionReport| {
            c.as_ref()
                .map(|cmd| cmd.substitute(registry, context, report))
        };
        Self {
            initialize: sub(&self.initialize, report),
            on_create: sub(&self.on_create, report),
            update_content: sub(&self.update_content, report),
            post_create: sub(&self.post_create, report),
            post_start: sub(&self.post_start, report),
            post_attach: sub(&self.post_attach, report),
        }
    }
}
