//! Variable substitution
//!
//! Substitution is driven by an explicit [`VariableRegistry`] built once and
//! handed to consumers. Each registered resolver owns one variable name; tokens
//! have the form `${name}` or `${name:argument}`.
//!
//! ## Standard variables
//!
//! - `${localWorkspaceFolder}` / `${localWorkspaceFolderBasename}`
//! - `${containerWorkspaceFolder}` / `${containerWorkspaceFolderBasename}`
//! - `${localEnv:VAR}` / `${localEnv:VAR:default}` - host environment, empty when unset
//! - `${containerEnv:VAR}` / `${containerEnv:VAR:default}` - only once container env is known
//! - `${devcontainerId}` - the workspace identifier
//!
//! Unknown variables are left unchanged and recorded in the report.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

static VARIABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("Variable substitution regex should be valid"));

/// Values available to resolvers
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Canonical workspace folder path on the host
    pub local_workspace_folder: String,
    /// Host environment variables
    pub local_env: HashMap<String, String>,
    /// Workspace identifier
    pub devcontainer_id: String,
    /// Workspace folder inside the container
    pub container_workspace_folder: Option<String>,
    /// Container environment, known only after the container exists
    pub container_env: Option<HashMap<String, String>>,
}

impl SubstitutionContext {
    /// Context for a canonical workspace root, capturing the host environment
    pub fn new(workspace_root: &Path, devcontainer_id: impl Into<String>) -> Self {
        Self {
            local_workspace_folder: workspace_root.to_string_lossy().to_string(),
            local_env: std::env::vars().collect(),
            devcontainer_id: devcontainer_id.into(),
            container_workspace_folder: None,
            container_env: None,
        }
    }

    pub fn with_local_env(mut self, local_env: HashMap<String, String>) -> Self {
        self.local_env = local_env;
        self
    }

    pub fn with_container_workspace_folder(mut self, folder: impl Into<String>) -> Self {
        self.container_workspace_folder = Some(folder.into());
        self
    }

    pub fn with_container_env(mut self, container_env: HashMap<String, String>) -> Self {
        self.container_env = Some(container_env);
        self
    }
}

/// Record of what a substitution pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubstitutionReport {
    /// Variable expressions mapped to their resolved values
    pub replacements: HashMap<String, String>,
    /// Expressions left unchanged
    pub unknown_variables: Vec<String>,
}

impl SubstitutionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replacement(&mut self, variable: String, value: String) {
        self.replacements.insert(variable, value);
    }

    pub fn add_unknown_variable(&mut self, variable: String) {
        if !self.unknown_variables.contains(&variable) {
            self.unknown_variables.push(variable);
        }
    }

    pub fn has_substitutions(&self) -> bool {
        !self.replacements.is_empty()
    }
}

/// Resolves one variable; receives the text after `name:` (if any)
pub type VariableResolver =
    Arc<dyn Fn(Option<&str>, &SubstitutionContext) -> Option<String> + Send + Sync>;

/// Something that can expand variable tokens in a string
pub trait Substitute: Send + Sync {
    fn substitute(
        &self,
        input: &str,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> String;
}

/// Named variable resolvers
#[derive(Clone, Default)]
pub struct VariableRegistry {
    resolvers: HashMap<String, VariableResolver>,
}

impl fmt::Debug for VariableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.resolvers.keys().collect();
        names.sort();
        f.debug_struct("VariableRegistry")
            .field("variables", &names)
            .finish()
    }
}

impl VariableRegistry {
    /// Registry with no resolvers
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the standard variables
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("localWorkspaceFolder", |_, ctx| {
            Some(ctx.local_workspace_folder.clone())
        });
        registry.register("localWorkspaceFolderBasename", |_, ctx| {
            Some(basename(&ctx.local_workspace_folder))
        });
        registry.register("containerWorkspaceFolder", |_, ctx| {
            ctx.container_workspace_folder.clone()
        });
        registry.register("containerWorkspaceFolderBasename", |_, ctx| {
            ctx.container_workspace_folder.as_deref().map(basename)
        });
        registry.register("devcontainerId", |_, ctx| Some(ctx.devcontainer_id.clone()));
        registry.register("localEnv", |arg, ctx| {
            let (name, default) = split_env_argument(arg?);
            Some(
                ctx.local_env
                    .get(name)
                    .cloned()
                    .or(default)
                    .unwrap_or_default(),
            )
        });
        registry.register("containerEnv", |arg, ctx| {
            let (name, default) = split_env_argument(arg?);
            let env = ctx.container_env.as_ref()?;
            Some(env.get(name).cloned().or(default).unwrap_or_default())
        });
        registry
    }

    /// Register (or replace) the resolver for `name`
    pub fn register<F>(&mut self, name: &str, resolver: F) -> &mut Self
    where
        F: Fn(Option<&str>, &SubstitutionContext) -> Option<String> + Send + Sync + 'static,
    {
        self.resolvers.insert(name.to_string(), Arc::new(resolver));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    fn resolve(&self, expression: &str, context: &SubstitutionContext) -> Option<String> {
        let (name, argument) = match expression.split_once(':') {
            Some((name, argument)) => (name, Some(argument)),
            None => (expression, None),
        };
        let resolver = self.resolvers.get(name)?;
        resolver(argument, context)
    }

    /// Expand every known token in `input`
    pub fn substitute(
        &self,
        input: &str,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> String {
        VARIABLE_PATTERN
            .replace_all(input, |caps: &regex::Captures| {
                let expression = &caps[1];
                match self.resolve(expression, context) {
                    Some(value) => {
                        report.add_replacement(expression.to_string(), value.clone());
                        value
                    }
                    None => {
                        debug!("Unknown variable '{}' - leaving unchanged", expression);
                        report.add_unknown_variable(expression.to_string());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }
}

impl Substitute for VariableRegistry {
    fn substitute(
        &self,
        input: &str,
        context: &SubstitutionContext,
        report: &mut SubstitutionReport,
    ) -> String {
        VariableRegistry::substitute(self, input, context, report)
    }
}

/// Substitute every string inside a JSON value; object keys are left alone
pub fn substitute_json(
    substitute: &dyn Substitute,
    value: &Value,
    context: &SubstitutionContext,
    report: &mut SubstitutionReport,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute.substitute(s, context, report)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_json(substitute, item, context, report))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_json(substitute, v, context, report)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn split_env_argument(argument: &str) -> (&str, Option<String>) {
    match argument.split_once(':') {
        Some((name, default)) => (name, Some(default.to_string())),
        None => (argument, None),
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
