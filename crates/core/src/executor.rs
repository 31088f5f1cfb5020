//! Reconciliation pipeline
//!
//! [`Executor`] runs five stages in sequence, each feeding the next:
//!
//! 1. **Parse** locates and parses the configuration and builds a workspace
//!    without resolving features
//! 2. **Resolve** rebuilds the workspace with the feature resolver when
//!    features are declared
//! 3. **Plan** classifies the live state and decides the action
//! 4. **Build** pulls or builds the base image and derives the feature layer
//! 5. **Deploy** creates or starts the containers, labelled with the
//!    workspace hashes
//!
//! Every stage reports start, progress and completion to the progress sink
//! and failures come back attributed to their stage.

use crate::compose::{project_name, ComposeDriver, ComposeUpRequest};
use crate::config::ConfigSource;
use crate::dockerfile::FeatureLayerDockerfile;
use crate::errors::{BuildError, ConfigError, Result, RuntimeError, StevedoreError};
use crate::features::FeatureResolver;
use crate::hooks::{HookRun, HookRunner, HostCommandRunner, ProcessHostRunner};
use crate::labels::ResourceLabels;
use crate::planner::{BuildStep, Plan, PlanAction, Planner};
use crate::progress::{NoopProgress, PipelineStage, ProgressSink};
use crate::runtime::{BuildRequest, ContainerEngine, CreateRequest};
use crate::settings::EngineSettings;
use crate::state::{ContainerState, RuntimeState, StateManager};
use crate::variable::VariableRegistry;
use crate::workspace::{BuildInfo, PlanType, Workspace, WorkspaceBuilder};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Command keeping a container alive when the configuration overrides it
const KEEP_ALIVE: &str = "trap 'exit 0' TERM; while sleep 1000 & wait $!; do :; done";

/// Options of [`Executor::up`]
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub workspace_root: PathBuf,
    /// Configuration file; discovered when `None`
    pub config_path: Option<PathBuf>,
    pub name_override: Option<String>,
    pub force_recreate: bool,
    pub force_rebuild: bool,
}

impl UpOptions {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Default::default()
        }
    }
}

/// Result of [`Executor::up`]
#[derive(Debug, Clone)]
pub struct UpResult {
    pub workspace: Workspace,
    pub plan: Plan,
    /// Primary container
    pub container_id: String,
    pub action_taken: PlanAction,
}

/// The reconciliation pipeline
pub struct Executor {
    engine: Arc<dyn ContainerEngine>,
    config_source: Arc<dyn ConfigSource>,
    resolver: Option<Arc<dyn FeatureResolver>>,
    compose: Option<Arc<dyn ComposeDriver>>,
    host_runner: Arc<dyn HostCommandRunner>,
    progress: Arc<dyn ProgressSink>,
    registry: VariableRegistry,
    settings: EngineSettings,
}

impl Executor {
    pub fn new(engine: Arc<dyn ContainerEngine>, config_source: Arc<dyn ConfigSource>) -> Self {
        Self {
            engine,
            config_source,
            resolver: None,
            compose: None,
            host_runner: Arc::new(ProcessHostRunner),
            progress: Arc::new(NoopProgress),
            registry: VariableRegistry::standard(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_feature_resolver(mut self, resolver: Arc<dyn FeatureResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_compose(mut self, compose: Arc<dyn ComposeDriver>) -> Self {
        self.compose = Some(compose);
        self
    }

    pub fn with_host_runner(mut self, host_runner: Arc<dyn HostCommandRunner>) -> Self {
        self.host_runner = host_runner;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_registry(mut self, registry: VariableRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run `work` as `stage`, reporting to the progress sink
    async fn stage<T, F>(&self, stage: PipelineStage, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.progress.stage_start(stage);
        match work.await {
            Ok(value) => {
                self.progress.stage_complete(stage, None);
                Ok(value)
            }
            Err(error) => {
                self.progress.stage_complete(stage, Some(error.to_string()));
                Err(error.in_stage(stage))
            }
        }
    }

    /// Locate, parse and resolve the configuration without features
    #[instrument(skip_all, fields(workspace_root = %options.workspace_root.display()))]
    pub async fn parse(&self, options: &UpOptions) -> Result<Workspace> {
        self.stage(PipelineStage::Parse, async {
            let (parsed, config_path) = self
                .config_source
                .load(&options.workspace_root, options.config_path.as_deref())?;
            self.progress
                .progress(PipelineStage::Parse, "configuration loaded", 50);
            WorkspaceBuilder::new(&self.registry)
                .build(
                    &parsed,
                    &options.workspace_root,
                    &config_path,
                    options.name_override.as_deref(),
                    None,
                )
                .await
        })
        .await
    }

    /// Rebuild the workspace with resolved features
    #[instrument(skip_all, fields(workspace_id = %workspace.id))]
    pub async fn resolve(&self, workspace: Workspace) -> Result<Workspace> {
        self.stage(PipelineStage::Resolve, async {
            let resolver = match &self.resolver {
                Some(resolver) if !workspace.raw_config.config.features.is_empty() => resolver,
                _ => {
                    debug!("No features to resolve");
                    return Ok(workspace);
                }
            };
            self.progress.progress(
                PipelineStage::Resolve,
                &format!(
                    "resolving {} feature(s)",
                    workspace.raw_config.config.features.len()
                ),
                10,
            );
            let name_override = Some(workspace.name.as_str());
            WorkspaceBuilder::new(&self.registry)
                .build(
                    &workspace.raw_config,
                    &workspace.root,
                    &workspace.config_path,
                    name_override,
                    Some(resolver.as_ref()),
                )
                .await
        })
        .await
    }

    /// Classify the live state, attach it to the workspace and plan
    #[instrument(skip_all, fields(workspace_id = %workspace.id))]
    pub async fn plan(
        &self,
        workspace: &mut Workspace,
        force_recreate: bool,
        force_rebuild: bool,
    ) -> Result<Plan> {
        self.stage(PipelineStage::Plan, async {
            let project = compose_project(workspace);
            let (runtime, _) = StateManager::new(self.engine.as_ref())
                .runtime_state(
                    &workspace.id,
                    project.as_deref(),
                    Some(workspace.hashes.overall.as_str()),
                )
                .await?;
            self.progress.progress(
                PipelineStage::Plan,
                &format!("container state: {}", runtime.status),
                50,
            );
            let status = runtime.status;
            workspace.state = Some(runtime);
            Ok(Planner::plan(workspace, status, force_recreate, force_rebuild))
        })
        .await
    }

    /// Execute the plan's image build steps
    #[instrument(skip_all, fields(workspace_id = %workspace.id, action = %plan.action))]
    pub async fn build(&self, workspace: &mut Workspace, plan: &Plan) -> Result<()> {
        self.stage(PipelineStage::Build, async {
            if !plan.action.creates_containers() || plan.build_steps.is_empty() {
                debug!("Nothing to build");
                return Ok(());
            }
            let started = Instant::now();
            let no_cache = plan.action == PlanAction::Rebuild || self.settings.build_no_cache;
            let total = plan.build_steps.len();
            let mut base_image: Option<String> = None;
            let mut derived_image = None;

            for (index, step) in plan.build_steps.iter().enumerate() {
                let percentage = ((index * 100) / total) as u8;
                match step {
                    BuildStep::PullImage { image } => {
                        self.progress.progress(
                            PipelineStage::Build,
                            &format!("pulling {}", image),
                            percentage,
                        );
                        if no_cache || !self.engine.image_exists(image).await? {
                            self.engine.pull_image(image).await?;
                        } else {
                            debug!("Image {} already present", image);
                        }
                        base_image = Some(image.clone());
                    }
                    BuildStep::BuildDockerfile {
                        tag,
                        dockerfile,
                        context,
                        args,
                        target,
                    } => {
                        if !context.is_dir() {
                            return Err(BuildError::MissingBuildContext {
                                path: context.display().to_string(),
                            }
                            .into());
                        }
                        self.progress.progress(
                            PipelineStage::Build,
                            &format!("building {}", tag),
                            percentage,
                        );
                        let image = self
                            .engine
                            .build_image(&BuildRequest {
                                tag: tag.clone(),
                                dockerfile: dockerfile.clone(),
                                context: context.clone(),
                                args: args.clone(),
                                target: target.clone(),
                                labels: BTreeMap::new(),
                                no_cache,
                            })
                            .await?;
                        base_image = Some(image);
                    }
                    BuildStep::FeatureLayer { tag, features } => {
                        let base = base_image.clone().ok_or_else(|| BuildError::Build {
                            image: tag.clone(),
                            message: "feature layer has no base image".to_string(),
                        })?;
                        self.progress.progress(
                            PipelineStage::Build,
                            &format!("installing {} feature(s)", features.len()),
                            percentage,
                        );
                        let context = feature_context_dir(&workspace.id);
                        let dockerfile = FeatureLayerDockerfile::prepare_context(
                            &context,
                            &base,
                            &workspace.resolved.features,
                        )?;
                        let image = self
                            .engine
                            .build_image(&BuildRequest {
                                tag: tag.clone(),
                                dockerfile,
                                context,
                                labels: BTreeMap::from([(
                                    crate::labels::LABEL_FEATURES.to_string(),
                                    features.join(","),
                                )]),
                                no_cache,
                                ..Default::default()
                            })
                            .await?;
                        derived_image = Some(image);
                    }
                }
            }

            let base_image = base_image.ok_or_else(|| BuildError::Build {
                image: workspace.built_image_name(),
                message: "no base image step in plan".to_string(),
            })?;
            let duration = started.elapsed();
            info!(
                "Built {} in {:.1}s",
                derived_image.as_deref().unwrap_or(&base_image),
                duration.as_secs_f64()
            );
            workspace.build = Some(BuildInfo {
                base_image,
                derived_image,
                duration,
            });
            Ok(())
        })
        .await
    }

    /// Create or start the plan's containers and return the primary one
    #[instrument(skip_all, fields(workspace_id = %workspace.id, action = %plan.action))]
    pub async fn deploy(&self, workspace: &Workspace, plan: &Plan) -> Result<String> {
        self.stage(PipelineStage::Deploy, async {
            if workspace.plan_type() == PlanType::Compose {
                return self.deploy_compose(workspace, plan).await;
            }
            let existing = workspace.state.as_ref().and_then(|s| s.container_id.clone());
            match plan.action {
                PlanAction::None => existing.ok_or_else(|| {
                    RuntimeError::ContainerNotFound {
                        id: workspace.container_name(),
                    }
                    .into()
                }),
                PlanAction::Start => {
                    let id = existing.ok_or_else(|| RuntimeError::ContainerNotFound {
                        id: workspace.container_name(),
                    })?;
                    self.progress
                        .progress(PipelineStage::Deploy, "starting container", 50);
                    self.engine.start_container(&id).await?;
                    Ok(id)
                }
                PlanAction::Create | PlanAction::Recreate | PlanAction::Rebuild => {
                    self.remove_existing(workspace).await?;
                    let request = self.create_request(workspace)?;
                    self.progress
                        .progress(PipelineStage::Deploy, "creating container", 40);
                    let id = self.engine.create_container(&request).await?;
                    self.progress
                        .progress(PipelineStage::Deploy, "starting container", 80);
                    self.engine.start_container(&id).await?;
                    info!("Container {} ({}) is running", request.name, id);
                    Ok(id)
                }
            }
        })
        .await
    }

    /// Remove every resource of the workspace
    async fn remove_existing(&self, workspace: &Workspace) -> Result<()> {
        let selector = ResourceLabels::selector(&workspace.id, None);
        let mut ids: Vec<String> = self
            .engine
            .list_by_labels(&selector)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        // A container without labels may still hold the name
        if let Some(by_name) = self
            .engine
            .inspect_container(&workspace.container_name())
            .await?
        {
            if !ids.contains(&by_name.id) {
                ids.push(by_name.id);
            }
        }
        for id in ids {
            debug!("Removing container {}", id);
            self.engine.remove_container(&id).await?;
        }
        Ok(())
    }

    fn create_request(&self, workspace: &Workspace) -> Result<CreateRequest> {
        let resolved = &workspace.resolved;
        let config = &resolved.config;
        let image = match &workspace.build {
            Some(build) => build.final_image().to_string(),
            None => resolved
                .image
                .clone()
                .ok_or_else(|| ConfigError::MissingPlan {
                    path: workspace.config_path.display().to_string(),
                })?,
        };
        let mut mounts = vec![resolved.workspace_mount.clone()];
        mounts.extend(config.mounts.iter().map(|m| m.to_mount_arg()));

        let command = if config.override_command.unwrap_or(true) {
            vec!["/bin/sh".to_string(), "-c".to_string(), KEEP_ALIVE.to_string()]
        } else {
            Vec::new()
        };
        let entrypoint = match (&resolved.entrypoint, command.is_empty()) {
            (Some(entrypoint), _) => Some(entrypoint.clone()),
            (None, false) => Some(String::new()),
            (None, true) => None,
        };

        Ok(CreateRequest {
            name: workspace.container_name(),
            image,
            labels: ResourceLabels::for_workspace(workspace, true, None),
            env: config.container_env.clone(),
            mounts,
            working_dir: Some(resolved.workspace_folder.clone()),
            user: config.container_user.clone(),
            privileged: config.privileged.unwrap_or(false),
            init: config.init.unwrap_or(false),
            cap_add: config.cap_add.clone(),
            security_opt: config.security_opt.clone(),
            run_args: config.run_args.clone(),
            entrypoint,
            command,
        })
    }

    async fn deploy_compose(&self, workspace: &Workspace, plan: &Plan) -> Result<String> {
        let driver = self.compose.as_ref().ok_or_else(|| ConfigError::Validation {
            message: "compose configuration requires a compose driver".to_string(),
        })?;
        let compose = workspace
            .resolved
            .compose
            .as_ref()
            .ok_or_else(|| ConfigError::MissingPlan {
                path: workspace.config_path.display().to_string(),
            })?;

        let steps = if plan.containers.is_empty() {
            Planner::container_steps(workspace)
        } else {
            plan.containers.clone()
        };
        let labels = steps
            .iter()
            .map(|step| {
                let service = step.service.clone().unwrap_or_else(|| step.name.clone());
                let labels = ResourceLabels::for_workspace(workspace, step.primary, Some(&service));
                (service, labels)
            })
            .collect();
        let working_dir = compose
            .files
            .first()
            .and_then(|f| f.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| workspace.root.clone());
        let state = workspace.state.as_ref().map(|s| s.status);

        let request = ComposeUpRequest {
            project: project_name(workspace),
            files: compose.files.clone(),
            working_dir,
            services: steps
                .iter()
                .map(|s| s.service.clone().unwrap_or_else(|| s.name.clone()))
                .collect(),
            primary_service: compose.service.clone(),
            labels,
            env: workspace.resolved.config.container_env.clone(),
            mounts: vec![workspace.resolved.workspace_mount.clone()],
            force_recreate: plan.action.replaces_container()
                || state.map(|s| s.needs_recreate()).unwrap_or(false),
            build: plan.action == PlanAction::Rebuild,
        };
        self.progress
            .progress(PipelineStage::Deploy, "starting compose services", 40);
        let containers = driver.up(&request).await?;
        containers
            .into_iter()
            .find(|c| c.service == compose.service)
            .map(|c| c.id)
            .ok_or_else(|| {
                RuntimeError::ContainerNotFound {
                    id: compose.service.clone(),
                }
                .into()
            })
    }

    /// Run every stage, skipping Build and Deploy when nothing has to change
    #[instrument(skip_all, fields(workspace_root = %options.workspace_root.display()))]
    pub async fn up(&self, options: &UpOptions) -> Result<UpResult> {
        let workspace = self.parse(options).await?;
        let mut workspace = self.resolve(workspace).await?;
        let mut plan = self
            .plan(&mut workspace, options.force_recreate, options.force_rebuild)
            .await?;

        // Replacement decided from state still honors an explicit rebuild
        if options.force_rebuild
            && plan.action.creates_containers()
            && plan.action != PlanAction::Rebuild
        {
            plan.action = PlanAction::Rebuild;
            plan.reason = format!("force rebuild requested ({})", plan.reason);
        }

        if plan.is_noop() {
            let container_id = workspace
                .state
                .as_ref()
                .and_then(|s| s.container_id.clone())
                .ok_or_else(|| {
                    StevedoreError::from(RuntimeError::ContainerNotFound {
                        id: workspace.container_name(),
                    })
                    .in_stage(PipelineStage::Deploy)
                })?;
            info!("Workspace {} is up to date", workspace.id);
            return Ok(UpResult {
                workspace,
                action_taken: PlanAction::None,
                plan,
                container_id,
            });
        }

        info!("{}: {}", plan.action, plan.reason);
        self.build(&mut workspace, &plan).await?;
        let container_id = self.deploy(&workspace, &plan).await?;
        workspace.state = Some(RuntimeState {
            status: ContainerState::Running,
            hashes: Some(workspace.hashes.clone()),
            container_id: Some(container_id.clone()),
        });

        Ok(UpResult {
            workspace,
            action_taken: plan.action,
            plan,
            container_id,
        })
    }

    /// Hook runner for the primary container of an `up` result
    pub fn hook_runner(&self, result: &UpResult) -> HookRunner {
        let wait_for = self
            .settings
            .wait_for(result.workspace.resolved.config.wait_for.as_deref());
        HookRunner::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.host_runner),
            &result.workspace,
            result.container_id.clone(),
            wait_for,
        )
        .with_background_timeout(self.settings.background_hook_timeout)
    }

    /// Run the hooks the action calls for
    ///
    /// Created containers run the create sequence, started ones run
    /// `postStartCommand`, and untouched ones run nothing.
    pub async fn run_hooks(
        &self,
        result: &UpResult,
        cancel: &CancellationToken,
    ) -> Result<Option<HookRun>> {
        let runner = self.hook_runner(result);
        match result.action_taken {
            PlanAction::None => Ok(None),
            PlanAction::Start => runner.run_start_hooks(cancel).await.map(Some),
            PlanAction::Create | PlanAction::Recreate | PlanAction::Rebuild => {
                runner.run_all_create_hooks(cancel).await.map(Some)
            }
        }
    }
}

fn compose_project(workspace: &Workspace) -> Option<String> {
    (workspace.plan_type() == PlanType::Compose).then(|| project_name(workspace))
}

fn feature_context_dir(workspace_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stevedore-{}-features", workspace_id))
}
