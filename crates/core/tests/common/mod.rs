//! Shared test helpers for core integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use stevedore_core::config::FileConfigSource;
use stevedore_core::features::LocalFeatureResolver;
use stevedore_core::hooks::HostCommandRunner;
use stevedore_core::progress::RecordingProgress;
use stevedore_core::runtime::mock::MockEngine;
use stevedore_core::runtime::ExecResult;
use stevedore_core::settings::EngineSettings;
use stevedore_core::Executor;
use tempfile::TempDir;

/// Write `.devcontainer/devcontainer.json` under `root`
pub fn write_config(root: &Path, content: &str) -> PathBuf {
    let dir = root.join(".devcontainer");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("devcontainer.json");
    std::fs::write(&path, content).unwrap();
    path
}

/// Write a local feature under `.devcontainer/<name>`
pub fn write_feature(root: &Path, name: &str, metadata: &str) -> PathBuf {
    let dir = root.join(".devcontainer").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("devcontainer-feature.json"), metadata).unwrap();
    std::fs::write(dir.join("install.sh"), "#!/bin/sh\nset -e\n").unwrap();
    dir
}

/// Host runner recording every command instead of running it
#[derive(Debug, Clone, Default)]
pub struct RecordingHostRunner {
    calls: Arc<Mutex<Vec<(Vec<String>, PathBuf)>>>,
    exit_code: i32,
}

impl RecordingHostRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(Vec<String>, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostCommandRunner for RecordingHostRunner {
    async fn run(
        &self,
        argv: &[String],
        working_dir: &Path,
    ) -> stevedore_core::Result<ExecResult> {
        self.calls
            .lock()
            .unwrap()
            .push((argv.to_vec(), working_dir.to_path_buf()));
        Ok(ExecResult {
            exit_code: self.exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// A workspace directory with an executor wired to mocks
pub struct TestRig {
    pub dir: TempDir,
    pub engine: MockEngine,
    pub host: RecordingHostRunner,
    pub progress: Arc<RecordingProgress>,
}

impl TestRig {
    pub fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), config);
        Self {
            dir,
            engine: MockEngine::new(),
            host: RecordingHostRunner::new(),
            progress: Arc::new(RecordingProgress::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn rewrite_config(&self, config: &str) {
        write_config(self.dir.path(), config);
    }

    pub fn executor(&self) -> Executor {
        Executor::new(Arc::new(self.engine.clone()), Arc::new(FileConfigSource::new()))
            .with_feature_resolver(Arc::new(LocalFeatureResolver::new()))
            .with_host_runner(Arc::new(self.host.clone()))
            .with_progress(self.progress.clone())
            .with_settings(EngineSettings::default())
    }
}
