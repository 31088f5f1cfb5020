//! Lifecycle hook execution
//!
//! Hook points run in lifecycle order. Points up to and including the
//! wait-for point block the caller and a failure among them is fatal. Later
//! points are spawned as background tasks whose failures are collected and
//! logged but never propagated. A detached reporter task awaits the
//! background tasks and logs a summary.
//!
//! Each devcontainer-level hook is followed by the same hook of every feature,
//! in installation order, with the same blocking or background
//! classification.

use crate::errors::{LifecycleError, Result, RuntimeError};
use crate::lifecycle::{LifecycleCommandValue, LifecycleCommands, LifecycleHook, WaitFor};
use crate::runtime::{ContainerEngine, ExecRequest, ExecResult};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const SHELL: &str = "/bin/sh";

/// Runs host-side commands (`initializeCommand`)
#[async_trait]
pub trait HostCommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], working_dir: &Path) -> Result<ExecResult>;
}

/// Host runner spawning local processes
#[derive(Debug, Clone, Default)]
pub struct ProcessHostRunner;

#[async_trait]
impl HostCommandRunner for ProcessHostRunner {
    #[instrument(skip(self))]
    async fn run(&self, argv: &[String], working_dir: &Path) -> Result<ExecResult> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        };
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RuntimeError::Engine {
                operation: "host command".to_string(),
                message: format!("failed to spawn {}: {}", program, e),
            })?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// A background hook point that failed
#[derive(Debug, Clone, PartialEq)]
pub struct HookFailure {
    pub hook: LifecycleHook,
    pub error: LifecycleError,
}

/// Outcome of a hook sequence whose blocking prefix succeeded
#[derive(Debug)]
pub struct HookRun {
    /// Hook points that ran in the foreground, in order
    pub foreground: Vec<LifecycleHook>,
    /// Hook points dispatched to the background, in dispatch order
    pub background: Vec<LifecycleHook>,
    failures: Arc<Mutex<Vec<HookFailure>>>,
    pending: Arc<AtomicUsize>,
    reporter: Option<JoinHandle<()>>,
}

impl HookRun {
    /// Background hook points that have not finished yet
    pub fn background_pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Snapshot of background failures recorded so far
    pub fn failures(&self) -> Vec<HookFailure> {
        lock(&self.failures).clone()
    }

    /// Wait for every background hook and return the failures
    ///
    /// Callers never have to call this; background hooks finish on their own.
    pub async fn wait_background(&mut self) -> Vec<HookFailure> {
        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                warn!("Background hook reporter failed: {}", e);
            }
        }
        self.failures()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One command of a hook point
#[derive(Debug, Clone)]
struct HookStep {
    hook: LifecycleHook,
    /// Feature contributing the command; `None` for the configuration's own
    feature: Option<String>,
    command: LifecycleCommandValue,
}

impl HookStep {
    fn label(&self) -> String {
        match &self.feature {
            Some(feature) => format!("{} (feature {})", self.hook.config_key(), feature),
            None => self.hook.config_key().to_string(),
        }
    }
}

/// Immutable state shared with background tasks
struct HookContext {
    engine: Arc<dyn ContainerEngine>,
    host: Arc<dyn HostCommandRunner>,
    container_id: String,
    workspace_root: PathBuf,
    workspace_folder: String,
    user: Option<String>,
    env: HashMap<String, String>,
    commands: LifecycleCommands,
    /// Feature id and commands, in installation order
    features: Vec<(String, LifecycleCommands)>,
}

impl HookContext {
    fn steps(&self, hook: LifecycleHook) -> Vec<HookStep> {
        let mut steps = Vec::new();
        if let Some(command) = self.commands.get(hook).filter(|c| !c.is_empty()) {
            steps.push(HookStep {
                hook,
                feature: None,
                command: command.clone(),
            });
        }
        if hook.accepts_feature_commands() {
            for (feature, commands) in &self.features {
                if let Some(command) = commands.get(hook).filter(|c| !c.is_empty()) {
                    steps.push(HookStep {
                        hook,
                        feature: Some(feature.clone()),
                        command: command.clone(),
                    });
                }
            }
        }
        steps
    }

    /// Run the steps of one hook point; the first failure stops the point
    async fn run_point(
        self: &Arc<Self>,
        steps: &[HookStep],
    ) -> std::result::Result<(), LifecycleError> {
        for step in steps {
            self.run_step(step).await?;
        }
        Ok(())
    }

    async fn run_step(
        self: &Arc<Self>,
        step: &HookStep,
    ) -> std::result::Result<(), LifecycleError> {
        let label = step.label();
        info!("Running {}", label);
        match &step.command {
            LifecycleCommandValue::Parallel(entries) => {
                let mut tasks = JoinSet::new();
                for (index, (name, command)) in entries.iter().enumerate() {
                    let Some(argv) = argv(command) else {
                        warn!("Skipping nested command '{}' in {}", name, label);
                        continue;
                    };
                    let context = Arc::clone(self);
                    let entry_label = format!("{} [{}]", label, name);
                    let hook = step.hook;
                    let display = command.display();
                    tasks.spawn(async move {
                        let result = context.run_argv(hook, &entry_label, &argv, &display).await;
                        (index, result)
                    });
                }
                let mut results = Vec::new();
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(outcome) => results.push(outcome),
                        Err(e) => results.push((
                            usize::MAX,
                            Err(LifecycleError::Exec {
                                hook: label.clone(),
                                message: format!("task failed: {}", e),
                            }),
                        )),
                    }
                }
                results.sort_by_key(|(index, _)| *index);
                results
                    .into_iter()
                    .map(|(_, result)| result)
                    .find(|result| result.is_err())
                    .unwrap_or(Ok(()))
            }
            command => match argv(command) {
                Some(argv) => {
                    self.run_argv(step.hook, &label, &argv, &command.display())
                        .await
                }
                None => Ok(()),
            },
        }
    }

    async fn run_argv(
        &self,
        hook: LifecycleHook,
        label: &str,
        argv: &[String],
        display: &str,
    ) -> std::result::Result<(), LifecycleError> {
        debug!("{}: {:?}", label, argv);
        let result = if hook.is_host_side() {
            self.host.run(argv, &self.workspace_root).await
        } else {
            self.engine
                .exec(&ExecRequest {
                    container_id: self.container_id.clone(),
                    command: argv.to_vec(),
                    working_dir: Some(self.workspace_folder.clone()),
                    user: self.user.clone(),
                    env: self.env.clone(),
                })
                .await
        };
        let result = result.map_err(|e| LifecycleError::Exec {
            hook: label.to_string(),
            message: e.to_string(),
        })?;
        if result.success() {
            debug!("{} completed", label);
            Ok(())
        } else {
            if !result.stderr.trim().is_empty() {
                debug!("{} stderr: {}", label, result.stderr.trim());
            }
            Err(LifecycleError::HookFailed {
                hook: label.to_string(),
                exit_code: result.exit_code,
                command: display.to_string(),
            })
        }
    }
}

/// Argument vector of a single command; `None` for maps and empty commands
fn argv(command: &LifecycleCommandValue) -> Option<Vec<String>> {
    match command {
        LifecycleCommandValue::Shell(script) if !script.trim().is_empty() => Some(vec![
            SHELL.to_string(),
            "-c".to_string(),
            script.clone(),
        ]),
        LifecycleCommandValue::Exec(args) if !args.is_empty() => Some(args.clone()),
        _ => None,
    }
}

/// Executes lifecycle hooks against a live container
pub struct HookRunner {
    context: Arc<HookContext>,
    wait_for: WaitFor,
    background_timeout: Option<Duration>,
}

impl HookRunner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        host_runner: Arc<dyn HostCommandRunner>,
        workspace: &Workspace,
        container_id: impl Into<String>,
        wait_for: WaitFor,
    ) -> Self {
        let resolved = &workspace.resolved;
        let context = HookContext {
            engine,
            host: host_runner,
            container_id: container_id.into(),
            workspace_root: workspace.root.clone(),
            workspace_folder: resolved.workspace_folder.clone(),
            user: resolved.exec_user().map(str::to_string),
            env: resolved.exec_env(),
            commands: resolved.lifecycle.clone(),
            features: resolved
                .features
                .iter()
                .map(|f| (f.id.clone(), f.metadata.lifecycle_commands()))
                .collect(),
        };
        Self {
            context: Arc::new(context),
            wait_for,
            background_timeout: None,
        }
    }

    /// Time budget of each background hook point
    pub fn with_background_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.background_timeout = timeout;
        self
    }

    pub fn wait_for(&self) -> WaitFor {
        self.wait_for
    }

    /// Run the create-time sequence, `initializeCommand` through `postStartCommand`
    #[instrument(skip_all, fields(container_id = %self.context.container_id, wait_for = %self.wait_for.hook()))]
    pub async fn run_all_create_hooks(&self, cancel: &CancellationToken) -> Result<HookRun> {
        self.run_sequence(LifecycleHook::create_sequence(), cancel)
            .await
    }

    /// Run `postStartCommand` only, for a restarted container
    #[instrument(skip_all, fields(container_id = %self.context.container_id))]
    pub async fn run_start_hooks(&self, cancel: &CancellationToken) -> Result<HookRun> {
        self.run_sequence(&[LifecycleHook::PostStart], cancel).await
    }

    /// Run `postAttachCommand` in the foreground
    #[instrument(skip_all, fields(container_id = %self.context.container_id))]
    pub async fn run_attach_hooks(&self, cancel: &CancellationToken) -> Result<()> {
        let steps = self.context.steps(LifecycleHook::PostAttach);
        if steps.is_empty() {
            return Ok(());
        }
        self.run_blocking(LifecycleHook::PostAttach, &steps, cancel)
            .await
    }

    async fn run_sequence(
        &self,
        hooks: &[LifecycleHook],
        cancel: &CancellationToken,
    ) -> Result<HookRun> {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        let mut foreground = Vec::new();
        let mut background = Vec::new();

        for &hook in hooks {
            let steps = self.context.steps(hook);
            if steps.is_empty() {
                debug!("No commands for {}", hook.config_key());
                continue;
            }
            if self.wait_for.blocks(hook) {
                self.run_blocking(hook, &steps, cancel).await?;
                foreground.push(hook);
            } else {
                debug!("Dispatching {} to the background", hook.config_key());
                handles.push(self.dispatch(hook, steps, &failures, &pending));
                background.push(hook);
            }
        }

        let reporter = if handles.is_empty() {
            None
        } else {
            Some(spawn_reporter(handles, Arc::clone(&failures)))
        };

        Ok(HookRun {
            foreground,
            background,
            failures,
            pending,
            reporter,
        })
    }

    async fn run_blocking(
        &self,
        hook: LifecycleHook,
        steps: &[HookStep],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cancelled = || LifecycleError::Cancelled {
            hook: hook.config_key().to_string(),
        };
        if cancel.is_cancelled() {
            return Err(cancelled().into());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("{} cancelled", hook.config_key());
                Err(cancelled().into())
            }
            result = self.context.run_point(steps) => result.map_err(Into::into),
        }
    }

    fn dispatch(
        &self,
        hook: LifecycleHook,
        steps: Vec<HookStep>,
        failures: &Arc<Mutex<Vec<HookFailure>>>,
        pending: &Arc<AtomicUsize>,
    ) -> JoinHandle<()> {
        let context = Arc::clone(&self.context);
        let failures = Arc::clone(failures);
        let pending = Arc::clone(pending);
        let timeout = self.background_timeout;
        pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, context.run_point(&steps))
                    .await
                    .unwrap_or_else(|_| {
                        Err(LifecycleError::Timeout {
                            hook: hook.config_key().to_string(),
                            seconds: limit.as_secs(),
                        })
                    }),
                None => context.run_point(&steps).await,
            };
            if let Err(error) = outcome {
                warn!("Background {} failed: {}", hook.config_key(), error);
                lock(&failures).push(HookFailure { hook, error });
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

fn spawn_reporter(
    handles: Vec<JoinHandle<()>>,
    failures: Arc<Mutex<Vec<HookFailure>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let total = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background hook task aborted: {}", e);
            }
        }
        let failures = lock(&failures);
        if failures.is_empty() {
            info!("{} background lifecycle hook(s) completed", total);
        } else {
            let summary: Vec<String> = failures.iter().map(|f| f.error.to_string()).collect();
            warn!(
                "{} of {} background lifecycle hook(s) failed: {}",
                failures.len(),
                total,
                summary.join("; ")
            );
        }
    })
}
