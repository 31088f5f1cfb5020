//! Reconciliation planning
//!
//! The [`Planner`] compares the desired workspace with the classified state
//! of its live resource and decides what to do. Rules are evaluated in order
//! and the first match wins:
//!
//! | state               | force rebuild | force recreate | action   |
//! |---------------------|---------------|----------------|----------|
//! | running             | yes           |                | rebuild  |
//! | running             | no            | yes            | recreate |
//! | running             | no            | no             | none     |
//! | stale               |               |                | recreate |
//! | broken              |               |                | recreate |
//! | unknown             |               |                | recreate |
//! | absent              |               |                | create   |
//! | created, stopped    | yes           |                | rebuild  |
//! | created, stopped    | no            | yes            | recreate |
//! | created, stopped    | no            | no             | start    |

use crate::state::ContainerState;
use crate::workspace::{PlanType, Workspace};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Decided action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    None,
    Start,
    Create,
    Recreate,
    Rebuild,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::None => "none",
            PlanAction::Start => "start",
            PlanAction::Create => "create",
            PlanAction::Recreate => "recreate",
            PlanAction::Rebuild => "rebuild",
        }
    }

    /// Whether the action produces new containers (and therefore images)
    pub fn creates_containers(&self) -> bool {
        matches!(
            self,
            PlanAction::Create | PlanAction::Recreate | PlanAction::Rebuild
        )
    }

    /// Whether an existing container is replaced
    pub fn replaces_container(&self) -> bool {
        matches!(self, PlanAction::Recreate | PlanAction::Rebuild)
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image build step, executed in order
#[derive(Debug, Clone, PartialEq)]
pub enum BuildStep {
    /// Make the base image available
    PullImage { image: String },
    /// Build the base image from a Dockerfile
    BuildDockerfile {
        tag: String,
        dockerfile: PathBuf,
        context: PathBuf,
        args: IndexMap<String, String>,
        target: Option<String>,
    },
    /// Derive an image installing features on top of the previous step's image
    FeatureLayer { tag: String, features: Vec<String> },
}

/// One container to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStep {
    pub name: String,
    /// Compose service, for compose plans
    pub service: Option<String>,
    pub primary: bool,
}

/// The decided action and its supporting steps
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub action: PlanAction,
    pub reason: String,
    /// Changed fragments, when staleness caused the decision
    pub changed: Vec<String>,
    pub build_steps: Vec<BuildStep>,
    pub containers: Vec<ContainerStep>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.action == PlanAction::None
    }
}

pub struct Planner;

impl Planner {
    /// Decide how to bring `workspace` from `state` to its desired state
    pub fn plan(
        workspace: &Workspace,
        state: ContainerState,
        force_recreate: bool,
        force_rebuild: bool,
    ) -> Plan {
        let mut changed = Vec::new();
        let (action, reason) = match state {
            ContainerState::Running if force_rebuild => {
                (PlanAction::Rebuild, "force rebuild requested".to_string())
            }
            ContainerState::Running if force_recreate => {
                (PlanAction::Recreate, "force recreate requested".to_string())
            }
            ContainerState::Running => (PlanAction::None, "up to date and running".to_string()),
            ContainerState::Stale => {
                changed = Self::changed_fragments(workspace);
                (
                    PlanAction::Recreate,
                    format!("configuration changed: {}", changed.join(", ")),
                )
            }
            ContainerState::Broken => (PlanAction::Recreate, "container state is broken".to_string()),
            ContainerState::Unknown => {
                (PlanAction::Recreate, "container state is unknown".to_string())
            }
            ContainerState::Absent => (PlanAction::Create, "no container found".to_string()),
            ContainerState::Created | ContainerState::Stopped if force_rebuild => {
                (PlanAction::Rebuild, "force rebuild requested".to_string())
            }
            ContainerState::Created | ContainerState::Stopped if force_recreate => {
                (PlanAction::Recreate, "force recreate requested".to_string())
            }
            ContainerState::Created | ContainerState::Stopped => (
                PlanAction::Start,
                "container exists but stopped/created".to_string(),
            ),
        };

        let (build_steps, containers) = if action.creates_containers() {
            (Self::build_steps(workspace), Self::container_steps(workspace))
        } else {
            (Vec::new(), Vec::new())
        };

        debug!(
            "Planned {} for workspace {} ({}): {}",
            action, workspace.id, state, reason
        );
        Plan {
            action,
            reason,
            changed,
            build_steps,
            containers,
        }
    }

    fn changed_fragments(workspace: &Workspace) -> Vec<String> {
        let recorded = workspace.state.as_ref().and_then(|s| s.hashes.as_ref());
        match recorded {
            Some(recorded) => {
                let changed = workspace.hashes.changed_fragments(recorded);
                if changed.is_empty() {
                    vec!["content hash changed".to_string()]
                } else {
                    changed
                }
            }
            None => vec!["content hash changed".to_string()],
        }
    }

    /// Image build steps of the resolved plan
    ///
    /// Compose plans build through the compose driver and get no steps of
    /// their own.
    pub fn build_steps(workspace: &Workspace) -> Vec<BuildStep> {
        let resolved = &workspace.resolved;
        let mut steps = Vec::new();
        match resolved.plan_type {
            PlanType::Image => {
                if let Some(image) = &resolved.image {
                    steps.push(BuildStep::PullImage {
                        image: image.clone(),
                    });
                }
            }
            PlanType::Dockerfile => {
                if let Some(plan) = &resolved.dockerfile {
                    steps.push(BuildStep::BuildDockerfile {
                        tag: workspace.built_image_name(),
                        dockerfile: plan.dockerfile.clone(),
                        context: plan.context.clone(),
                        args: plan.args.clone(),
                        target: plan.target.clone(),
                    });
                }
            }
            PlanType::Compose => return steps,
        }
        if workspace.has_features() {
            steps.push(BuildStep::FeatureLayer {
                tag: workspace.derived_image_name(),
                features: resolved.feature_ids(),
            });
        }
        steps
    }

    /// Containers to create, primary first
    pub fn container_steps(workspace: &Workspace) -> Vec<ContainerStep> {
        match &workspace.resolved.compose {
            Some(compose) => {
                let mut steps = vec![ContainerStep {
                    name: compose.service.clone(),
                    service: Some(compose.service.clone()),
                    primary: true,
                }];
                for service in &compose.run_services {
                    if service != &compose.service {
                        steps.push(ContainerStep {
                            name: service.clone(),
                            service: Some(service.clone()),
                            primary: false,
                        });
                    }
                }
                steps
            }
            None => vec![ContainerStep {
                name: workspace.container_name(),
                service: None,
                primary: true,
            }],
        }
    }
}
