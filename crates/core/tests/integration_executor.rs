//! End-to-end reconciliation through the executor with mock collaborators

mod common;

use common::{write_feature, TestRig};
use std::sync::Arc;
use stevedore_core::compose::mock::MockCompose;
use stevedore_core::errors::{BuildError, ConfigError};
use stevedore_core::labels::{LABEL_HASH_OVERALL, LABEL_PRIMARY, LABEL_WORKSPACE_ID};
use stevedore_core::lifecycle::LifecycleHook;
use stevedore_core::progress::{PipelineStage, ProgressEvent};
use stevedore_core::runtime::{ContainerEngine, ContainerStatus};
use stevedore_core::{PlanAction, StevedoreError, UpOptions};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_create_then_noop_then_recreate_on_config_change() {
    let rig = TestRig::new(r#"{"image": "alpine", "features": {}}"#);
    let executor = rig.executor();
    let options = UpOptions::new(rig.root());

    let first = executor.up(&options).await.unwrap();
    assert_eq!(first.action_taken, PlanAction::Create);
    assert_eq!(first.plan.reason, "no container found");
    assert_eq!(rig.engine.pulls(), vec!["alpine"]);

    let containers = rig.engine.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].id, first.container_id);
    assert_eq!(containers[0].status, ContainerStatus::Running);
    assert_eq!(containers[0].labels[LABEL_WORKSPACE_ID], first.workspace.id);
    assert_eq!(containers[0].labels[LABEL_PRIMARY], "true");
    assert_eq!(
        containers[0].labels[LABEL_HASH_OVERALL],
        first.workspace.hashes.overall
    );

    let second = executor.up(&options).await.unwrap();
    assert_eq!(second.action_taken, PlanAction::None);
    assert_eq!(second.plan.reason, "up to date and running");
    assert_eq!(second.container_id, first.container_id);
    assert_eq!(rig.engine.creates().len(), 1);

    rig.rewrite_config(r#"{"image": "alpine", "features": {}, "containerEnv": {"DEBUG": "1"}}"#);
    let third = executor.up(&options).await.unwrap();
    assert_eq!(third.action_taken, PlanAction::Recreate);
    assert!(
        third.plan.reason.contains("devcontainer.json changed"),
        "reason: {}",
        third.plan.reason
    );
    assert_ne!(third.container_id, first.container_id);
    assert_eq!(rig.engine.removed(), vec![first.container_id.clone()]);
    assert_eq!(rig.engine.containers().len(), 1);
    assert_eq!(
        rig.engine.creates()[1].env.get("DEBUG").map(String::as_str),
        Some("1")
    );
}

#[tokio::test]
async fn test_create_request_carries_resolved_settings() {
    let rig = TestRig::new(
        r#"{
            "image": "alpine",
            "workspaceFolder": "/src",
            "containerUser": "dev",
            "capAdd": ["SYS_PTRACE"],
            "init": true,
            "mounts": ["type=volume,source=cache,target=/cache"]
        }"#,
    );
    let result = rig.executor().up(&UpOptions::new(rig.root())).await.unwrap();

    let request = &rig.engine.creates()[0];
    assert_eq!(request.name, result.workspace.container_name());
    assert_eq!(request.image, "alpine");
    assert_eq!(request.working_dir.as_deref(), Some("/src"));
    assert_eq!(request.user.as_deref(), Some("dev"));
    assert_eq!(request.cap_add, vec!["SYS_PTRACE"]);
    assert!(request.init);
    assert!(!request.privileged);
    assert_eq!(request.mounts[0], result.workspace.resolved.workspace_mount);
    assert!(request.mounts[0].ends_with("target=/src"));
    assert_eq!(request.mounts[1], "type=volume,source=cache,target=/cache");
    assert_eq!(request.command[0], "/bin/sh");
}

#[tokio::test]
async fn test_stopped_container_is_started() {
    let rig = TestRig::new(r#"{"image": "alpine", "postStartCommand": "echo started"}"#);
    let executor = rig.executor();
    let options = UpOptions::new(rig.root());

    let first = executor.up(&options).await.unwrap();
    rig.engine.stop_container(&first.container_id).await.unwrap();

    let second = executor.up(&options).await.unwrap();
    assert_eq!(second.action_taken, PlanAction::Start);
    assert_eq!(second.container_id, first.container_id);
    assert_eq!(rig.engine.creates().len(), 1);

    let mut run = executor
        .run_hooks(&second, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    run.wait_background().await;
    assert_eq!(run.foreground.len() + run.background.len(), 1);
    assert_eq!(rig.engine.exec_history().len(), 1);
}

#[tokio::test]
async fn test_force_recreate_replaces_running_container() {
    let rig = TestRig::new(r#"{"image": "alpine"}"#);
    let executor = rig.executor();
    let first = executor.up(&UpOptions::new(rig.root())).await.unwrap();

    let options = UpOptions {
        force_recreate: true,
        ..UpOptions::new(rig.root())
    };
    let second = executor.up(&options).await.unwrap();

    assert_eq!(second.action_taken, PlanAction::Recreate);
    assert_eq!(second.plan.reason, "force recreate requested");
    assert_eq!(rig.engine.removed(), vec![first.container_id]);
}

#[tokio::test]
async fn test_dockerfile_build_and_forced_rebuild() {
    let rig = TestRig::new(r#"{"build": {"dockerfile": "Dockerfile", "args": {"V": "1"}}}"#);
    std::fs::write(rig.root().join(".devcontainer/Dockerfile"), "FROM alpine\n").unwrap();
    let executor = rig.executor();

    let first = executor.up(&UpOptions::new(rig.root())).await.unwrap();
    let builds = rig.engine.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].tag, first.workspace.built_image_name());
    assert_eq!(builds[0].args.get("V").map(String::as_str), Some("1"));
    assert!(!builds[0].no_cache);
    assert_eq!(rig.engine.creates()[0].image, first.workspace.built_image_name());
    let build = first.workspace.build.as_ref().unwrap();
    assert_eq!(build.base_image, first.workspace.built_image_name());
    assert!(build.derived_image.is_none());

    let options = UpOptions {
        force_rebuild: true,
        ..UpOptions::new(rig.root())
    };
    let second = executor.up(&options).await.unwrap();
    assert_eq!(second.action_taken, PlanAction::Rebuild);
    assert!(rig.engine.builds()[1].no_cache);
}

#[tokio::test]
async fn test_features_build_derived_image() {
    let rig = TestRig::new(
        r#"{"image": "alpine", "features": {"./tools": {"version": "2"}}}"#,
    );
    write_feature(
        rig.root(),
        "tools",
        r#"{"id": "tools", "containerEnv": {"TOOLS_HOME": "/opt/tools"}, "capAdd": ["NET_ADMIN"]}"#,
    );

    let result = rig.executor().up(&UpOptions::new(rig.root())).await.unwrap();

    let derived = result.workspace.derived_image_name();
    let builds = rig.engine.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].tag, derived);
    let dockerfile = std::fs::read_to_string(&builds[0].dockerfile).unwrap();
    assert!(dockerfile.contains("ARG _STEVEDORE_BASE_IMAGE=alpine"));
    assert!(dockerfile.contains("./install.sh"));
    let options = std::fs::read_to_string(
        builds[0]
            .context
            .join("tools_0")
            .join(stevedore_core::dockerfile::OPTIONS_ENV_FILE),
    )
    .unwrap();
    assert!(options.contains("export VERSION='2'"));

    let request = &rig.engine.creates()[0];
    assert_eq!(request.image, derived);
    assert_eq!(
        request.env.get("TOOLS_HOME").map(String::as_str),
        Some("/opt/tools")
    );
    assert!(request.cap_add.contains(&"NET_ADMIN".to_string()));
    assert!(!result.workspace.hashes.features.is_empty());
}

#[tokio::test]
async fn test_progress_reports_every_stage() {
    let rig = TestRig::new(r#"{"image": "alpine"}"#);
    let executor = rig.executor();

    executor.up(&UpOptions::new(rig.root())).await.unwrap();
    assert_eq!(rig.progress.started_stages(), PipelineStage::all().to_vec());
    let completions = rig
        .progress
        .events()
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::StageComplete { error: None, .. }))
        .count();
    assert_eq!(completions, 5);

    // An up-to-date workspace stops after planning
    executor.up(&UpOptions::new(rig.root())).await.unwrap();
    assert_eq!(
        rig.progress.started_stages()[5..].to_vec(),
        vec![PipelineStage::Parse, PipelineStage::Resolve, PipelineStage::Plan]
    );
}

#[tokio::test]
async fn test_errors_name_their_stage() {
    let rig = TestRig::new(r#"{"name": "no plan"}"#);
    let error = rig.executor().up(&UpOptions::new(rig.root())).await.unwrap_err();
    assert_eq!(error.stage(), Some(PipelineStage::Parse));
    assert!(matches!(
        error.root(),
        StevedoreError::Config(ConfigError::MissingPlan { .. })
    ));
    let last = rig.progress.events().pop().unwrap();
    assert!(matches!(
        last,
        ProgressEvent::StageComplete { stage: PipelineStage::Parse, error: Some(_), .. }
    ));

    let rig = TestRig::new(r#"{"build": {"dockerfile": "Dockerfile"}}"#);
    std::fs::write(rig.root().join(".devcontainer/Dockerfile"), "FROM alpine\n").unwrap();
    rig.engine.fail_build(true);
    let error = rig.executor().up(&UpOptions::new(rig.root())).await.unwrap_err();
    assert_eq!(error.stage(), Some(PipelineStage::Build));
    assert!(matches!(
        error.root(),
        StevedoreError::Build(BuildError::Build { .. })
    ));
    assert!(rig.engine.creates().is_empty());
}

#[tokio::test]
async fn test_unreachable_engine_fails_plan_stage() {
    let rig = TestRig::new(r#"{"image": "alpine"}"#);
    rig.engine.fail_daemon(true);
    let error = rig.executor().up(&UpOptions::new(rig.root())).await.unwrap_err();
    assert_eq!(error.stage(), Some(PipelineStage::Plan));
}

#[tokio::test]
async fn test_create_runs_create_hooks_with_configured_wait_for() {
    let rig = TestRig::new(
        r#"{
            "image": "alpine",
            "waitFor": "onCreateCommand",
            "initializeCommand": "echo init",
            "onCreateCommand": "echo create",
            "postCreateCommand": "echo post-create"
        }"#,
    );
    let executor = rig.executor();
    let result = executor.up(&UpOptions::new(rig.root())).await.unwrap();

    let mut run = executor
        .run_hooks(&result, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        run.foreground,
        vec![LifecycleHook::Initialize, LifecycleHook::OnCreate]
    );
    assert_eq!(run.background, vec![LifecycleHook::PostCreate]);
    assert!(run.wait_background().await.is_empty());
    assert_eq!(rig.host.calls().len(), 1);
    assert!(rig
        .engine
        .exec_history()
        .iter()
        .all(|call| call.request.container_id == result.container_id));

    let again = executor.up(&UpOptions::new(rig.root())).await.unwrap();
    assert!(executor
        .run_hooks(&again, &CancellationToken::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_compose_up_labels_services_and_detects_noop() {
    let rig = TestRig::new(
        r#"{
            "name": "My App",
            "dockerComposeFile": "docker-compose.yml",
            "service": "app",
            "runServices": ["app", "db"],
            "containerEnv": {"MODE": "dev"}
        }"#,
    );
    std::fs::write(
        rig.root().join(".devcontainer/docker-compose.yml"),
        "services:\n  app:\n    image: alpine\n  db:\n    image: postgres\n",
    )
    .unwrap();
    let compose = MockCompose::new(rig.engine.clone());
    let executor = rig.executor().with_compose(Arc::new(compose.clone()));
    let options = UpOptions::new(rig.root());

    let first = executor.up(&options).await.unwrap();
    assert_eq!(first.action_taken, PlanAction::Create);
    assert_eq!(first.container_id, "my-app-app-1-id");

    let request = &compose.requests()[0];
    assert_eq!(request.project, "my-app");
    assert_eq!(request.services, vec!["app", "db"]);
    assert_eq!(request.primary_service, "app");
    assert_eq!(request.labels["app"][LABEL_PRIMARY], "true");
    assert_eq!(request.labels["db"][LABEL_PRIMARY], "false");
    assert_eq!(request.env.get("MODE").map(String::as_str), Some("dev"));
    assert!(!request.force_recreate);
    assert!(rig.engine.builds().is_empty());

    let second = executor.up(&options).await.unwrap();
    assert_eq!(second.action_taken, PlanAction::None);
    assert_eq!(second.container_id, first.container_id);
    assert_eq!(compose.requests().len(), 1);

    std::fs::write(
        rig.root().join(".devcontainer/docker-compose.yml"),
        "services:\n  app:\n    image: debian\n  db:\n    image: postgres\n",
    )
    .unwrap();
    let third = executor.up(&options).await.unwrap();
    assert_eq!(third.action_taken, PlanAction::Recreate);
    assert!(third.plan.reason.contains("docker-compose files changed"));
    assert!(compose.requests()[1].force_recreate);
}

#[tokio::test]
async fn test_compose_without_driver_is_a_deploy_error() {
    let rig = TestRig::new(r#"{"dockerComposeFile": "docker-compose.yml", "service": "app"}"#);
    std::fs::write(
        rig.root().join(".devcontainer/docker-compose.yml"),
        "services:\n  app:\n    image: alpine\n",
    )
    .unwrap();

    let error = rig.executor().up(&UpOptions::new(rig.root())).await.unwrap_err();
    assert_eq!(error.stage(), Some(PipelineStage::Deploy));
}
