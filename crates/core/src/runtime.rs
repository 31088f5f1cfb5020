//! Container engine client
//!
//! [`ContainerEngine`] is the narrow seam through which the rest of the crate
//! talks to a container runtime. [`CliEngine`] drives a Docker-compatible CLI
//! (`docker` or `podman`); [`mock::MockEngine`] simulates one in memory for
//! tests.

use crate::errors::{BuildError, Result, RuntimeError};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Native container status as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
    Unknown,
}

impl ContainerStatus {
    /// Parse the engine's `State.Status` string
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            "removing" => ContainerStatus::Removing,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

/// Inspected container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    /// The container object exists but was never started
    pub never_started: bool,
    pub labels: BTreeMap<String, String>,
}

/// Listed container, as reported by the engine without inspection
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl From<&ContainerDetails> for ContainerSummary {
    fn from(details: &ContainerDetails) -> Self {
        Self {
            id: details.id.clone(),
            name: details.name.clone(),
            labels: details.labels.clone(),
        }
    }
}

/// Image build request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildRequest {
    /// Tag of the resulting image
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub args: IndexMap<String, String>,
    pub target: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub no_cache: bool,
}

/// Container creation request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: IndexMap<String, String>,
    /// `--mount` arguments, workspace mount first
    pub mounts: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
    pub init: bool,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    /// Extra arguments passed through verbatim, before the image
    pub run_args: Vec<String>,
    pub entrypoint: Option<String>,
    /// Command to run instead of the image default
    pub command: Vec<String>,
}

/// Command execution request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    pub container_id: String,
    /// Argument vector; never re-joined into a shell string
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub env: HashMap<String, String>,
}

/// Result of executing a command in a container
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container engine client abstraction
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Build an image and return its tag
    async fn build_image(&self, request: &BuildRequest) -> Result<String>;

    /// Create a container and return its identifier
    async fn create_container(&self, request: &CreateRequest) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn exec(&self, request: &ExecRequest) -> Result<ExecResult>;

    /// Containers, in any status, carrying every given label
    async fn list_by_labels(&self, labels: &BTreeMap<String, String>)
        -> Result<Vec<ContainerSummary>>;

    /// Inspect a container; `None` when it does not exist
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerDetails>>;

    async fn get_image_labels(&self, image: &str) -> Result<BTreeMap<String, String>>;
}

/// Docker-compatible CLI engine
#[derive(Debug, Clone)]
pub struct CliEngine {
    runtime_path: String,
}

impl CliEngine {
    pub fn docker() -> Self {
        Self::with_runtime_path("docker")
    }

    pub fn podman() -> Self {
        Self::with_runtime_path("podman")
    }

    pub fn with_runtime_path(runtime_path: impl Into<String>) -> Self {
        Self {
            runtime_path: runtime_path.into(),
        }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    async fn run(&self, operation: &str, args: &[String]) -> Result<std::process::Output> {
        debug!("{} {}", self.runtime_path, args.join(" "));
        Command::new(&self.runtime_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::NotInstalled {
                        runtime: self.runtime_path.clone(),
                    }
                } else {
                    RuntimeError::Engine {
                        operation: operation.to_string(),
                        message: e.to_string(),
                    }
                }
                .into()
            })
    }

    /// Run and require a zero exit status, returning trimmed stdout
    async fn run_checked(&self, operation: &str, args: &[String]) -> Result<String> {
        let output = self.run(operation, args).await?;
        if !output.status.success() {
            return Err(RuntimeError::Engine {
                operation: operation.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for CliEngine {
    fn default() -> Self {
        Self::docker()
    }
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn labels_from_json(value: Option<&serde_json::Value>) -> BTreeMap<String, String> {
    value
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one line of `docker ps --format '{{json .}}'` output
fn parse_ps_entry(value: &serde_json::Value) -> ContainerSummary {
    let field = |names: &[&str]| {
        names
            .iter()
            .filter_map(|name| value.get(*name))
            .find_map(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Array(items) => {
                    items.first().and_then(|i| i.as_str()).map(str::to_string)
                }
                _ => None,
            })
            .unwrap_or_default()
    };
    ContainerSummary {
        id: field(&["ID", "Id"]),
        name: field(&["Names", "Name"]),
        labels: match value.get("Labels") {
            // Podman emits an object, Docker a comma separated string
            Some(serde_json::Value::String(joined)) => parse_label_list(joined),
            other => labels_from_json(other),
        },
    }
}

/// Parse Docker's `k1=v1,k2=v2` label listing
///
/// A segment without `=` continues the previous value, which keeps values
/// containing commas intact.
fn parse_label_list(joined: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut last_key: Option<String> = None;
    for segment in joined.split(',').filter(|s| !s.is_empty()) {
        match segment.split_once('=') {
            Some((key, value)) => {
                labels.insert(key.to_string(), value.to_string());
                last_key = Some(key.to_string());
            }
            None => {
                if let Some(value) = last_key.as_ref().and_then(|k| labels.get_mut(k)) {
                    value.push(',');
                    value.push_str(segment);
                }
            }
        }
    }
    labels
}

/// Parse one element of `docker inspect` output
fn parse_inspect(value: &serde_json::Value) -> ContainerDetails {
    let state = value.get("State");
    let status = ContainerStatus::parse(
        state
            .and_then(|s| s.get("Status"))
            .and_then(|s| s.as_str())
            .unwrap_or("unknown"),
    );
    // Docker reports the zero time for containers that never ran
    let never_started = state
        .and_then(|s| s.get("StartedAt"))
        .and_then(|s| s.as_str())
        .map(|started| started.is_empty() || started.starts_with("0001-01-01"))
        .unwrap_or(status == ContainerStatus::Created);
    ContainerDetails {
        id: value
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        name: value
            .get("Name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: value
            .get("Config")
            .and_then(|c| c.get("Image"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        status,
        never_started,
        labels: labels_from_json(value.get("Config").and_then(|c| c.get("Labels"))),
    }
}

#[async_trait]
impl ContainerEngine for CliEngine {
    #[instrument(skip(self))]
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self
            .run("image inspect", &args(["image", "inspect", image]))
            .await?;
        Ok(output.status.success())
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, image: &str) -> Result<()> {
        self.run_checked("pull", &args(["pull", image]))
            .await
            .map_err(|e| BuildError::Pull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(tag = %request.tag))]
    async fn build_image(&self, request: &BuildRequest) -> Result<String> {
        let mut argv = args(["build", "-t", request.tag.as_str(), "-f"]);
        argv.push(request.dockerfile.display().to_string());
        for (key, value) in &request.args {
            argv.push("--build-arg".to_string());
            argv.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.labels {
            argv.push("--label".to_string());
            argv.push(format!("{}={}", key, value));
        }
        if let Some(target) = &request.target {
            argv.push("--target".to_string());
            argv.push(target.clone());
        }
        if request.no_cache {
            argv.push("--no-cache".to_string());
        }
        argv.push(request.context.display().to_string());

        self.run_checked("build", &argv)
            .await
            .map_err(|e| BuildError::Build {
                image: request.tag.clone(),
                message: e.to_string(),
            })?;
        Ok(request.tag.clone())
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    async fn create_container(&self, request: &CreateRequest) -> Result<String> {
        let mut argv = args(["create", "--name", request.name.as_str()]);
        for (key, value) in &request.labels {
            argv.push("--label".to_string());
            argv.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.env {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
        for mount in &request.mounts {
            argv.push("--mount".to_string());
            argv.push(mount.clone());
        }
        if let Some(dir) = &request.working_dir {
            argv.push("-w".to_string());
            argv.push(dir.clone());
        }
        if let Some(user) = &request.user {
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        if request.privileged {
            argv.push("--privileged".to_string());
        }
        if request.init {
            argv.push("--init".to_string());
        }
        for cap in &request.cap_add {
            argv.push("--cap-add".to_string());
            argv.push(cap.clone());
        }
        for opt in &request.security_opt {
            argv.push("--security-opt".to_string());
            argv.push(opt.clone());
        }
        if let Some(entrypoint) = &request.entrypoint {
            argv.push("--entrypoint".to_string());
            argv.push(entrypoint.clone());
        }
        argv.extend(request.run_args.iter().cloned());
        argv.push(request.image.clone());
        argv.extend(request.command.iter().cloned());

        let id = self.run_checked("create", &argv).await?;
        debug!("Created container {}", id);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.run_checked("start", &args(["start", id])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str) -> Result<()> {
        self.run_checked("stop", &args(["stop", id])).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> Result<()> {
        self.run_checked("rm", &args(["rm", "-f", id])).await.map(|_| ())
    }

    #[instrument(skip(self, request), fields(container_id = %request.container_id))]
    async fn exec(&self, request: &ExecRequest) -> Result<ExecResult> {
        let mut argv = args(["exec"]);
        if let Some(user) = &request.user {
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        if let Some(dir) = &request.working_dir {
            argv.push("-w".to_string());
            argv.push(dir.clone());
        }
        let mut env: Vec<_> = request.env.iter().collect();
        env.sort();
        for (key, value) in env {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
        argv.push(request.container_id.clone());
        argv.extend(request.command.iter().cloned());

        let output = self.run("exec", &argv).await?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn list_by_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>> {
        let mut argv = args(["ps", "--all", "--no-trunc", "--format", "{{json .}}"]);
        for (key, value) in labels {
            argv.push("--filter".to_string());
            argv.push(format!("label={}={}", key, value));
        }
        let stdout = self.run_checked("ps", &argv).await?;

        stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| {
                let value: serde_json::Value =
                    serde_json::from_str(line).map_err(|e| RuntimeError::Engine {
                        operation: "ps".to_string(),
                        message: format!("invalid listing output: {}", e),
                    })?;
                Ok(parse_ps_entry(&value))
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerDetails>> {
        let output = self
            .run("inspect", &args(["container", "inspect", id]))
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such") {
                return Ok(None);
            }
            return Err(RuntimeError::Engine {
                operation: "inspect".to_string(),
                message: stderr.trim().to_string(),
            }
            .into());
        }
        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|e| RuntimeError::Engine {
                operation: "inspect".to_string(),
                message: format!("invalid inspect output: {}", e),
            })?;
        Ok(parsed
            .as_array()
            .and_then(|items| items.first())
            .map(parse_inspect))
    }

    #[instrument(skip(self))]
    async fn get_image_labels(&self, image: &str) -> Result<BTreeMap<String, String>> {
        let stdout = self
            .run_checked(
                "image inspect",
                &args(["image", "inspect", "--format", "{{json .Config.Labels}}", image]),
            )
            .await?;
        let value: serde_json::Value =
            serde_json::from_str(&stdout).unwrap_or(serde_json::Value::Null);
        Ok(labels_from_json(Some(&value)))
    }
}

pub mod mock {
    //! In-memory container engine for tests
    //!
    //! Containers are kept in a list, exec calls are recorded, and exec
    //! responses (including a simulated duration) can be configured per
    //! command.

    use super::{
        BuildRequest, ContainerDetails, ContainerEngine, ContainerStatus, ContainerSummary,
        CreateRequest, ExecRequest, ExecResult,
    };
    use crate::errors::{Result, RuntimeError};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tracing::debug;

    /// Configured response of an exec call
    #[derive(Debug, Clone, Default)]
    pub struct MockExecResponse {
        pub exit_code: i32,
        /// Simulated execution time
        pub delay: Option<Duration>,
        pub stdout: Option<String>,
        pub stderr: Option<String>,
    }

    impl MockExecResponse {
        pub fn exit(exit_code: i32) -> Self {
            Self {
                exit_code,
                ..Default::default()
            }
        }

        pub fn delayed(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }
    }

    /// Record of an exec call
    #[derive(Debug, Clone)]
    pub struct MockExecCall {
        pub request: ExecRequest,
        pub started: Instant,
        pub finished: Option<Instant>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        containers: Vec<ContainerDetails>,
        images: HashSet<String>,
        image_labels: HashMap<String, BTreeMap<String, String>>,
        exec_responses: HashMap<String, MockExecResponse>,
        default_exec_response: MockExecResponse,
        exec_history: Vec<MockExecCall>,
        builds: Vec<BuildRequest>,
        creates: Vec<CreateRequest>,
        pulls: Vec<String>,
        removed: Vec<String>,
        fail_daemon: bool,
        fail_inspect: bool,
        fail_build: bool,
        next_id: usize,
    }

    /// Mock container engine
    #[derive(Debug, Clone, Default)]
    pub struct MockEngine {
        state: Arc<Mutex<MockState>>,
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub fn add_container(&self, container: ContainerDetails) {
            self.lock().containers.push(container);
        }

        pub fn containers(&self) -> Vec<ContainerDetails> {
            self.lock().containers.clone()
        }

        pub fn add_image(&self, image: &str) {
            self.lock().images.insert(image.to_string());
        }

        pub fn set_image_labels(&self, image: &str, labels: BTreeMap<String, String>) {
            self.lock().image_labels.insert(image.to_string(), labels);
        }

        /// Response for the exec whose argv joined by spaces equals `command`
        pub fn set_exec_response(&self, command: &str, response: MockExecResponse) {
            self.lock()
                .exec_responses
                .insert(command.to_string(), response);
        }

        pub fn set_default_exec_response(&self, response: MockExecResponse) {
            self.lock().default_exec_response = response;
        }

        /// Make listing and inspection fail, simulating an unreachable daemon
        pub fn fail_daemon(&self, fail: bool) {
            self.lock().fail_daemon = fail;
        }

        /// Make inspection fail while listing still succeeds
        pub fn fail_inspect(&self, fail: bool) {
            self.lock().fail_inspect = fail;
        }

        pub fn fail_build(&self, fail: bool) {
            self.lock().fail_build = fail;
        }

        pub fn exec_history(&self) -> Vec<MockExecCall> {
            self.lock().exec_history.clone()
        }

        pub fn builds(&self) -> Vec<BuildRequest> {
            self.lock().builds.clone()
        }

        pub fn creates(&self) -> Vec<CreateRequest> {
            self.lock().creates.clone()
        }

        pub fn pulls(&self) -> Vec<String> {
            self.lock().pulls.clone()
        }

        pub fn removed(&self) -> Vec<String> {
            self.lock().removed.clone()
        }

        fn set_status(&self, id: &str, status: ContainerStatus) -> Result<()> {
            let mut state = self.lock();
            let container = state
                .containers
                .iter_mut()
                .find(|c| c.id == id || c.name == id)
                .ok_or_else(|| RuntimeError::ContainerNotFound { id: id.to_string() })?;
            container.status = status;
            if status == ContainerStatus::Running {
                container.never_started = false;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        async fn image_exists(&self, image: &str) -> Result<bool> {
            Ok(self.lock().images.contains(image))
        }

        async fn pull_image(&self, image: &str) -> Result<()> {
            let mut state = self.lock();
            state.pulls.push(image.to_string());
            state.images.insert(image.to_string());
            Ok(())
        }

        async fn build_image(&self, request: &BuildRequest) -> Result<String> {
            let mut state = self.lock();
            if state.fail_build {
                return Err(crate::errors::BuildError::Build {
                    image: request.tag.clone(),
                    message: "mock build failure".to_string(),
                }
                .into());
            }
            state.builds.push(request.clone());
            state.images.insert(request.tag.clone());
            state
                .image_labels
                .insert(request.tag.clone(), request.labels.clone());
            Ok(request.tag.clone())
        }

        async fn create_container(&self, request: &CreateRequest) -> Result<String> {
            let mut state = self.lock();
            if state.containers.iter().any(|c| c.name == request.name) {
                return Err(RuntimeError::Engine {
                    operation: "create".to_string(),
                    message: format!("name {} is already in use", request.name),
                }
                .into());
            }
            state.next_id += 1;
            let id = format!("mock-{}", state.next_id);
            state.creates.push(request.clone());
            state.containers.push(ContainerDetails {
                id: id.clone(),
                name: request.name.clone(),
                image: request.image.clone(),
                status: ContainerStatus::Created,
                never_started: true,
                labels: request.labels.clone(),
            });
            debug!("MockEngine created container {}", id);
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            self.set_status(id, ContainerStatus::Running)
        }

        async fn stop_container(&self, id: &str) -> Result<()> {
            self.set_status(id, ContainerStatus::Exited)
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            let mut state = self.lock();
            let before = state.containers.len();
            state.containers.retain(|c| c.id != id && c.name != id);
            if state.containers.len() == before {
                return Err(RuntimeError::ContainerNotFound { id: id.to_string() }.into());
            }
            state.removed.push(id.to_string());
            Ok(())
        }

        async fn exec(&self, request: &ExecRequest) -> Result<ExecResult> {
            let (response, index) = {
                let mut state = self.lock();
                let response = state
                    .exec_responses
                    .get(&request.command.join(" "))
                    .cloned()
                    .unwrap_or_else(|| state.default_exec_response.clone());
                state.exec_history.push(MockExecCall {
                    request: request.clone(),
                    started: Instant::now(),
                    finished: None,
                });
                (response, state.exec_history.len() - 1)
            };

            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            self.lock().exec_history[index].finished = Some(Instant::now());

            Ok(ExecResult {
                exit_code: response.exit_code,
                stdout: response.stdout.unwrap_or_default(),
                stderr: response.stderr.unwrap_or_default(),
            })
        }

        async fn list_by_labels(
            &self,
            labels: &BTreeMap<String, String>,
        ) -> Result<Vec<ContainerSummary>> {
            let state = self.lock();
            if state.fail_daemon {
                return Err(RuntimeError::Engine {
                    operation: "ps".to_string(),
                    message: "mock daemon unavailable".to_string(),
                }
                .into());
            }
            Ok(state
                .containers
                .iter()
                .filter(|c| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
                .map(ContainerSummary::from)
                .collect())
        }

        async fn inspect_container(&self, id: &str) -> Result<Option<ContainerDetails>> {
            let state = self.lock();
            if state.fail_daemon || state.fail_inspect {
                return Err(RuntimeError::Engine {
                    operation: "inspect".to_string(),
                    message: "mock daemon unavailable".to_string(),
                }
                .into());
            }
            Ok(state
                .containers
                .iter()
                .find(|c| c.id == id || c.name == id)
                .cloned())
        }

        async fn get_image_labels(&self, image: &str) -> Result<BTreeMap<String, String>> {
            Ok(self
                .lock()
                .image_labels
                .get(image)
                .cloned()
                .unwrap_or_default())
        }
    }
}
