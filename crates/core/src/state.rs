//! Runtime state classification
//!
//! [`StateManager`] looks up the resources labelled with a workspace
//! identifier and classifies them into a [`ContainerState`]. It never mutates
//! anything, so it is safe to call repeatedly and concurrently.

use crate::errors::{Result, StateError};
use crate::hash::ContentHashes;
use crate::labels::ResourceLabels;
use crate::runtime::{ContainerDetails, ContainerEngine, ContainerStatus, ContainerSummary};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};

/// Classified state of a workspace's primary resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// The resource exists but its status could not be determined
    Unknown,
    Absent,
    /// Created and never started
    Created,
    Running,
    /// Exited after having run
    Stopped,
    /// Recorded hashes differ from the desired ones
    Stale,
    /// A resource without the primary marker occupies the workspace
    Broken,
}

/// Next step for a container state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    None,
    Restart,
    Rebuild,
    Remove,
}

impl ContainerState {
    pub const ALL: [ContainerState; 7] = [
        ContainerState::Unknown,
        ContainerState::Absent,
        ContainerState::Created,
        ContainerState::Running,
        ContainerState::Stopped,
        ContainerState::Stale,
        ContainerState::Broken,
    ];

    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ContainerState::Created | ContainerState::Running | ContainerState::Stopped
        )
    }

    pub fn can_start(&self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Stopped)
    }

    pub fn can_exec(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn needs_recreate(&self) -> bool {
        matches!(self, ContainerState::Stale | ContainerState::Broken)
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            ContainerState::Absent | ContainerState::Unknown => RecoveryAction::None,
            ContainerState::Created | ContainerState::Stopped => RecoveryAction::Restart,
            ContainerState::Stale => RecoveryAction::Rebuild,
            ContainerState::Broken => RecoveryAction::Remove,
            ContainerState::Running => RecoveryAction::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Unknown => "unknown",
            ContainerState::Absent => "absent",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Stale => "stale",
            ContainerState::Broken => "broken",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State observed on a live resource, attached to the workspace
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeState {
    pub status: ContainerState,
    /// Hashes recorded on the resource at creation time
    pub hashes: Option<ContentHashes>,
    pub container_id: Option<String>,
}

impl RuntimeState {
    pub fn new(status: ContainerState, resource: Option<&ContainerSummary>) -> Self {
        Self {
            status,
            hashes: resource.and_then(|r| ResourceLabels::recorded_hashes(&r.labels)),
            container_id: resource.map(|r| r.id.clone()),
        }
    }
}

/// Classifies the runtime resources of a workspace
pub struct StateManager<'a, E: ContainerEngine + ?Sized> {
    engine: &'a E,
}

impl<'a, E: ContainerEngine + ?Sized> StateManager<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// Classify the resources of `workspace_id`
    ///
    /// `project` narrows the lookup to one compose project. When
    /// `expected_overall` is given, a resource recording a different overall
    /// hash is [`ContainerState::Stale`] whatever its liveness. A primary
    /// resource that is listed but cannot be inspected is
    /// [`ContainerState::Unknown`].
    #[instrument(skip(self))]
    pub async fn get_state(
        &self,
        workspace_id: &str,
        project: Option<&str>,
        expected_overall: Option<&str>,
    ) -> Result<(ContainerState, Option<ContainerSummary>)> {
        let selector = ResourceLabels::selector(workspace_id, project);
        let resources = self
            .engine
            .list_by_labels(&selector)
            .await
            .map_err(|e| StateError::Inspection {
                workspace_id: workspace_id.to_string(),
                message: e.to_string(),
            })?;

        if resources.is_empty() {
            debug!("No resources for workspace {}", workspace_id);
            return Ok((ContainerState::Absent, None));
        }

        let Some(primary) = resources
            .iter()
            .find(|r| ResourceLabels::is_primary(&r.labels))
        else {
            warn!(
                "Workspace {} has {} resource(s) but none is marked primary",
                workspace_id,
                resources.len()
            );
            return Ok((ContainerState::Broken, resources.into_iter().next()));
        };

        let details = match self.engine.inspect_container(&primary.id).await {
            Ok(Some(details)) => details,
            Ok(None) => {
                debug!("Primary resource {} disappeared", primary.id);
                return Ok((ContainerState::Absent, None));
            }
            Err(e) => {
                warn!("Failed to inspect {}: {}", primary.id, e);
                return Ok((ContainerState::Unknown, Some(primary.clone())));
            }
        };

        let state = classify(&details, expected_overall);
        debug!("Workspace {} is {}", workspace_id, state);
        Ok((state, Some(ContainerSummary::from(&details))))
    }

    /// [`Self::get_state`] packaged for attaching to a workspace
    pub async fn runtime_state(
        &self,
        workspace_id: &str,
        project: Option<&str>,
        expected_overall: Option<&str>,
    ) -> Result<(RuntimeState, Option<ContainerSummary>)> {
        let (state, resource) = self
            .get_state(workspace_id, project, expected_overall)
            .await?;
        Ok((RuntimeState::new(state, resource.as_ref()), resource))
    }
}

/// Classify an inspected primary resource
fn classify(details: &ContainerDetails, expected_overall: Option<&str>) -> ContainerState {
    if let (Some(expected), Some(recorded)) = (
        expected_overall,
        ResourceLabels::recorded_hashes(&details.labels),
    ) {
        if recorded.overall != expected {
            return ContainerState::Stale;
        }
    }
    match details.status {
        ContainerStatus::Running | ContainerStatus::Restarting => ContainerState::Running,
        ContainerStatus::Created => ContainerState::Created,
        ContainerStatus::Exited | ContainerStatus::Dead if details.never_started => {
            ContainerState::Created
        }
        ContainerStatus::Exited | ContainerStatus::Dead => ContainerState::Stopped,
        ContainerStatus::Paused | ContainerStatus::Removing | ContainerStatus::Unknown => {
            ContainerState::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{LABEL_HASH_OVERALL, LABEL_PRIMARY};
    use crate::runtime::mock::MockEngine;
    use std::collections::BTreeMap;

    fn container(
        id: &str,
        status: ContainerStatus,
        never_started: bool,
        primary: Option<bool>,
        overall: Option<&str>,
    ) -> ContainerDetails {
        let mut labels = ResourceLabels::selector("ws", None);
        if let Some(primary) = primary {
            labels.insert(LABEL_PRIMARY.to_string(), primary.to_string());
        }
        if let Some(overall) = overall {
            labels.insert(LABEL_HASH_OVERALL.to_string(), overall.to_string());
        }
        ContainerDetails {
            id: id.to_string(),
            name: id.to_string(),
            image: "alpine".to_string(),
            status,
            never_started,
            labels,
        }
    }

    #[test]
    fn test_predicates_are_total() {
        for state in ContainerState::ALL {
            assert_eq!(
                state.is_usable(),
                matches!(
                    state,
                    ContainerState::Created | ContainerState::Running | ContainerState::Stopped
                ),
                "{}",
                state
            );
            assert_eq!(
                state.can_start(),
                matches!(state, ContainerState::Created | ContainerState::Stopped)
            );
            assert_eq!(state.can_exec(), state == ContainerState::Running);
            assert_eq!(
                state.needs_recreate(),
                matches!(state, ContainerState::Stale | ContainerState::Broken)
            );
        }
    }

    #[test]
    fn test_recovery_table() {
        let expected = [
            (ContainerState::Unknown, RecoveryAction::None),
            (ContainerState::Absent, RecoveryAction::None),
            (ContainerState::Created, RecoveryAction::Restart),
            (ContainerState::Running, RecoveryAction::None),
            (ContainerState::Stopped, RecoveryAction::Restart),
            (ContainerState::Stale, RecoveryAction::Rebuild),
            (ContainerState::Broken, RecoveryAction::Remove),
        ];
        for (state, action) in expected {
            assert_eq!(state.recovery(), action, "{}", state);
        }
    }

    #[tokio::test]
    async fn test_absent_when_nothing_listed() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        let (state, details) = StateManager::new(&engine).get_state("ws", None, None).await?;
        assert_eq!(state, ContainerState::Absent);
        assert!(details.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_without_primary_label() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        engine.add_container(container("c1", ContainerStatus::Running, false, None, Some("h")));
        let (state, details) = StateManager::new(&engine)
            .get_state("ws", None, Some("h"))
            .await?;
        assert_eq!(state, ContainerState::Broken);
        assert_eq!(details.unwrap().id, "c1");
        Ok(())
    }

    #[tokio::test]
    async fn test_status_mapping() -> anyhow::Result<()> {
        let cases = [
            (ContainerStatus::Running, false, ContainerState::Running),
            (ContainerStatus::Created, true, ContainerState::Created),
            (ContainerStatus::Exited, true, ContainerState::Created),
            (ContainerStatus::Exited, false, ContainerState::Stopped),
            (ContainerStatus::Dead, false, ContainerState::Stopped),
            (ContainerStatus::Paused, false, ContainerState::Unknown),
        ];
        for (status, never_started, expected) in cases {
            let engine = MockEngine::new();
            engine.add_container(container("c1", status, never_started, Some(true), Some("h")));
            let (state, _) = StateManager::new(&engine)
                .get_state("ws", None, Some("h"))
                .await?;
            assert_eq!(state, expected, "{:?} never_started={}", status, never_started);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_outranks_liveness() -> anyhow::Result<()> {
        for status in [ContainerStatus::Running, ContainerStatus::Exited] {
            let engine = MockEngine::new();
            engine.add_container(container("c1", status, false, Some(true), Some("old")));
            let (state, _) = StateManager::new(&engine)
                .get_state("ws", None, Some("new"))
                .await?;
            assert_eq!(state, ContainerState::Stale);
        }

        // Without an expected hash there is nothing to compare
        let engine = MockEngine::new();
        engine.add_container(container("c1", ContainerStatus::Running, false, Some(true), Some("old")));
        let (state, _) = StateManager::new(&engine).get_state("ws", None, None).await?;
        assert_eq!(state, ContainerState::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_failure_is_an_error() {
        let engine = MockEngine::new();
        engine.fail_daemon(true);
        let err = StateManager::new(&engine)
            .get_state("ws", None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ws"));
    }

    #[tokio::test]
    async fn test_uninspectable_primary_is_unknown() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        engine.add_container(container("c1", ContainerStatus::Running, false, Some(true), Some("h")));
        engine.fail_inspect(true);
        let (state, resource) = StateManager::new(&engine)
            .get_state("ws", None, Some("h"))
            .await?;
        assert_eq!(state, ContainerState::Unknown);
        assert_eq!(resource.map(|r| r.id), Some("c1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_other_workspaces_ignored() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        let mut foreign = container("c1", ContainerStatus::Running, false, Some(true), None);
        foreign.labels = BTreeMap::from([(
            crate::labels::LABEL_WORKSPACE_ID.to_string(),
            "other".to_string(),
        )]);
        engine.add_container(foreign);
        let (state, _) = StateManager::new(&engine).get_state("ws", None, None).await?;
        assert_eq!(state, ContainerState::Absent);
        Ok(())
    }

    #[tokio::test]
    async fn test_runtime_state_carries_recorded_hashes() -> anyhow::Result<()> {
        let engine = MockEngine::new();
        engine.add_container(container("c1", ContainerStatus::Running, false, Some(true), Some("h")));
        let (runtime, _) = StateManager::new(&engine)
            .runtime_state("ws", None, Some("h"))
            .await?;
        assert_eq!(runtime.status, ContainerState::Running);
        assert_eq!(runtime.container_id.as_deref(), Some("c1"));
        assert_eq!(runtime.hashes.unwrap().overall, "h");
        Ok(())
    }
}
