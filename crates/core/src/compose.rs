//! Docker Compose integration
//!
//! Compose plans are brought up through a [`ComposeDriver`]. The engine's
//! labels, the workspace mount and the container environment are injected
//! into the services with an override file piped on stdin (`-f -`), so the
//! user's compose files are never rewritten.

use crate::errors::{Result, RuntimeError};
use crate::workspace::Workspace;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

const FALLBACK_PROJECT: &str = "stevedore-compose";

/// Request to bring services up
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeUpRequest {
    pub project: String,
    /// Compose files in declaration order
    pub files: Vec<PathBuf>,
    /// Directory compose runs in
    pub working_dir: PathBuf,
    /// Services to start, primary first
    pub services: Vec<String>,
    pub primary_service: String,
    /// Labels per service
    pub labels: BTreeMap<String, BTreeMap<String, String>>,
    /// Environment injected into the primary service
    pub env: IndexMap<String, String>,
    /// `--mount` style specs injected into the primary service
    pub mounts: Vec<String>,
    /// Recreate containers even when compose considers them current
    pub force_recreate: bool,
    /// Build service images before starting
    pub build: bool,
}

/// A container started by compose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeContainer {
    pub service: String,
    pub id: String,
}

/// Compose driver abstraction
#[async_trait]
pub trait ComposeDriver: Send + Sync {
    /// Bring services up and return their containers
    async fn up(&self, request: &ComposeUpRequest) -> Result<Vec<ComposeContainer>>;
}

/// Compose project name of a workspace
///
/// The workspace name lower-cased, characters outside `[a-z0-9_-]`
/// collapsed into a single `-`, never starting with a separator.
pub fn project_name(workspace: &Workspace) -> String {
    sanitize_project_name(&workspace.name)
}

fn sanitize_project_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut last_was_dash = false;
    for ch in name.chars() {
        let lc = ch.to_ascii_lowercase();
        if lc.is_ascii_alphanumeric() {
            sanitized.push(lc);
            last_was_dash = false;
        } else if lc == '_' || lc == '-' {
            sanitized.push(lc);
            last_was_dash = lc == '-';
        } else if !last_was_dash {
            sanitized.push('-');
            last_was_dash = true;
        }
    }
    let sanitized = sanitized.trim_matches(|c: char| c == '-' || c == '_');
    if sanitized.is_empty() {
        FALLBACK_PROJECT.to_string()
    } else {
        sanitized.to_string()
    }
}

/// Override file injecting labels, environment and mounts
pub fn injection_override(request: &ComposeUpRequest) -> String {
    let mut yaml = String::from("services:\n");
    for service in &request.services {
        yaml.push_str(&format!("  {}:\n", service));
        if let Some(labels) = request.labels.get(service) {
            if !labels.is_empty() {
                yaml.push_str("    labels:\n");
                for (key, value) in labels {
                    yaml.push_str(&format!("      {}: {}\n", key, quote(value)));
                }
            }
        }
        if service != &request.primary_service {
            continue;
        }
        if !request.env.is_empty() {
            yaml.push_str("    environment:\n");
            for (key, value) in &request.env {
                yaml.push_str(&format!("      {}: {}\n", key, quote(value)));
            }
        }
        if !request.mounts.is_empty() {
            yaml.push_str("    volumes:\n");
            for mount in &request.mounts {
                let mut first = true;
                for (key, value) in mount_fields(mount) {
                    let prefix = if first { "      - " } else { "        " };
                    yaml.push_str(&format!("{}{}: {}\n", prefix, key, quote(&value)));
                    first = false;
                }
            }
        }
    }
    yaml
}

/// Long-form volume fields of a `--mount` spec
fn mount_fields(spec: &str) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    for part in spec.split(',') {
        let (key, value) = part.split_once('=').unwrap_or((part, "true"));
        let key = match key.trim() {
            "src" => "source",
            "dst" | "destination" => "target",
            "readonly" | "ro" => "read_only",
            other => other,
        };
        fields.push((key.to_string(), value.trim().to_string()));
    }
    fields
}

fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// `docker compose` driver
#[derive(Debug, Clone)]
pub struct CliCompose {
    docker_path: String,
}

impl CliCompose {
    pub fn new(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    fn base_args(&self, request: &ComposeUpRequest, with_override: bool) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-p".to_string(),
            request.project.clone(),
        ];
        for file in &request.files {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        if with_override {
            args.push("-f".to_string());
            args.push("-".to_string());
        }
        args
    }

    async fn run(
        &self,
        request: &ComposeUpRequest,
        args: Vec<String>,
        stdin_input: Option<&str>,
    ) -> Result<String> {
        debug!("{} {}", self.docker_path, args.join(" "));
        let mut command = Command::new(&self.docker_path);
        command
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(if stdin_input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let engine_error = |message: String| RuntimeError::Engine {
            operation: "compose".to_string(),
            message,
        };
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::NotInstalled {
                    runtime: self.docker_path.clone(),
                }
            } else {
                engine_error(e.to_string())
            }
        })?;
        if let (Some(input), Some(mut stdin)) = (stdin_input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| engine_error(format!("failed to write override: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| engine_error(e.to_string()))?;
        if !output.status.success() {
            return Err(engine_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for CliCompose {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ComposeDriver for CliCompose {
    #[instrument(skip(self, request), fields(project = %request.project))]
    async fn up(&self, request: &ComposeUpRequest) -> Result<Vec<ComposeContainer>> {
        let override_file = injection_override(request);
        let mut args = self.base_args(request, true);
        args.extend(["up".to_string(), "-d".to_string()]);
        if request.force_recreate {
            args.push("--force-recreate".to_string());
        }
        if request.build {
            args.push("--build".to_string());
        }
        args.extend(request.services.iter().cloned());
        self.run(request, args, Some(&override_file)).await?;

        let mut containers = Vec::new();
        for service in &request.services {
            let mut args = self.base_args(request, false);
            args.extend(["ps".to_string(), "-q".to_string(), service.clone()]);
            let id = self.run(request, args, None).await?;
            if let Some(id) = id.lines().next().filter(|l| !l.is_empty()) {
                containers.push(ComposeContainer {
                    service: service.clone(),
                    id: id.to_string(),
                });
            }
        }
        debug!("Compose started {} container(s)", containers.len());
        Ok(containers)
    }
}

pub mod mock {
    //! Compose driver backed by [`MockEngine`]
    //!
    //! Each requested service becomes a running container in the engine,
    //! carrying the labels from the request, so state inspection sees it.

    use super::{ComposeContainer, ComposeDriver, ComposeUpRequest};
    use crate::errors::Result;
    use crate::runtime::mock::MockEngine;
    use crate::runtime::{ContainerDetails, ContainerEngine, ContainerStatus};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct MockCompose {
        engine: MockEngine,
        requests: Arc<Mutex<Vec<ComposeUpRequest>>>,
    }

    impl MockCompose {
        pub fn new(engine: MockEngine) -> Self {
            Self {
                engine,
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn requests(&self) -> Vec<ComposeUpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ComposeDriver for MockCompose {
        async fn up(&self, request: &ComposeUpRequest) -> Result<Vec<ComposeContainer>> {
            self.requests.lock().unwrap().push(request.clone());
            let mut containers = Vec::new();
            for service in &request.services {
                let name = format!("{}-{}-1", request.project, service);
                let existing = self.engine.inspect_container(&name).await?;
                if existing.is_some() {
                    if !request.force_recreate {
                        self.engine.start_container(&name).await?;
                        let id = existing.map(|d| d.id).unwrap_or_default();
                        containers.push(ComposeContainer {
                            service: service.clone(),
                            id,
                        });
                        continue;
                    }
                    self.engine.remove_container(&name).await?;
                }
                let id = format!("{}-id", name);
                self.engine.add_container(ContainerDetails {
                    id: id.clone(),
                    name,
                    image: format!("{}-{}", request.project, service),
                    status: ContainerStatus::Running,
                    never_started: false,
                    labels: request.labels.get(service).cloned().unwrap_or_default(),
                });
                containers.push(ComposeContainer {
                    service: service.clone(),
                    id,
                });
            }
            Ok(containers)
        }
    }
}
