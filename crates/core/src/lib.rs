//! Core library for reconciling development containers
//!
//! This crate turns a `devcontainer.json` into running containers: it parses
//! and resolves the configuration, fingerprints it, classifies the live
//! container state, plans the cheapest action, builds and deploys, then runs
//! the lifecycle hooks with a configurable wait-for point.

pub mod compose;
pub mod config;
pub mod dockerfile;
pub mod errors;
pub mod executor;
pub mod features;
pub mod hash;
pub mod hooks;
pub mod labels;
pub mod lifecycle;
pub mod logging;
pub mod planner;
pub mod progress;
pub mod runtime;
pub mod settings;
pub mod state;
pub mod variable;
pub mod workspace;

pub use errors::{Result, StevedoreError};
pub use executor::{Executor, UpOptions, UpResult};
pub use hash::ContentHashes;
pub use planner::{Plan, PlanAction, Planner};
pub use state::{ContainerState, StateManager};
pub use workspace::{Workspace, WorkspaceBuilder};

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
