//! Orchestration engine capabilities
//!
//! The engine owns container lifecycle. Keel only talks to it through the
//! narrow traits in this module, so the planner and controller never depend
//! on a concrete engine.

pub mod client;
pub mod docker;

pub use client::{EngineClientConfig, TlsBundle, TlsPreferences};
pub use docker::DockerEngine;

use crate::compose::ComposeConfig;
use crate::env::Environment;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Convergence action decided by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceAction {
    Noop,
    Create,
    Recreate,
    Start,
    /// Any other action an engine reports
    Other(String),
}

impl ConvergenceAction {
    pub fn as_str(&self) -> &str {
        match self {
            ConvergenceAction::Noop => "noop",
            ConvergenceAction::Create => "create",
            ConvergenceAction::Recreate => "recreate",
            ConvergenceAction::Start => "start",
            ConvergenceAction::Other(action) => action,
        }
    }
}

impl std::fmt::Display for ConvergenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConvergenceAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Container targeted by a plan; `id` is absent until the container exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedContainer {
    pub name: String,
    pub id: Option<String>,
}

/// Engine decision for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvergencePlan {
    pub action: ConvergenceAction,
    pub containers: Vec<PlannedContainer>,
}

/// Where a `volumes_from` entry takes its volumes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    /// Another service of the same project
    Service(String),
    /// A container outside the project
    Container(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumesFrom {
    pub source: VolumeSource,
    pub mode: String,
}

/// Read-only facts about a declared service
pub trait ServiceDescriptor: Send + Sync {
    fn name(&self) -> &str;

    /// Declared image reference, if any
    fn image_name(&self) -> Option<&str>;

    /// Declared service options
    fn options(&self) -> serde_json::Value;

    /// `(service, alias)` link pairs
    fn link_names(&self) -> Vec<(String, String)>;

    fn network_mode_id(&self) -> String;

    /// Attached networks keyed by full network name
    fn networks(&self) -> BTreeMap<String, serde_json::Value>;

    fn volumes_from(&self) -> Vec<VolumesFrom>;

    fn dependency_names(&self) -> Vec<String>;

    fn linked_service_names(&self) -> Vec<String>;

    /// Peer services this service takes volumes from
    fn volumes_from_names(&self) -> Vec<String> {
        self.volumes_from()
            .into_iter()
            .filter_map(|v| match v.source {
                VolumeSource::Service(name) => Some(name),
                VolumeSource::Container(_) => None,
            })
            .collect()
    }
}

/// Access to the image a service currently runs from
#[async_trait]
pub trait ImageInspectable: Send + Sync {
    /// Identifier of the local image, `None` when the engine does not have it
    async fn image_id(&self) -> Result<Option<String>>;
}

/// Source of convergence decisions
#[async_trait]
pub trait ConvergencePlanProvider: Send + Sync {
    /// Decide how to converge the service toward a configuration hash
    async fn convergence_plan(&self, config_hash: &str) -> Result<ConvergencePlan>;
}

#[async_trait]
pub trait Scalable: Send + Sync {
    async fn scale(&self, replicas: u32) -> Result<()>;
}

/// Everything the controller needs from one engine service
pub trait EngineService: ServiceDescriptor + ImageInspectable + ConvergencePlanProvider + Scalable {}

impl<T> EngineService for T where T: ServiceDescriptor + ImageInspectable + ConvergencePlanProvider + Scalable {}

/// Parameters of a project `up`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpRequest {
    /// Restrict to these services; empty means all
    pub services: Vec<String>,
    pub start_deps: bool,
    pub build: bool,
    /// Stop timeout in seconds
    pub timeout: Option<u64>,
    pub detached: bool,
    pub remove_orphans: bool,
    /// Planner hash per service, recorded on the containers the engine creates
    pub config_hashes: BTreeMap<String, String>,
}

impl Default for UpRequest {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            start_deps: true,
            build: false,
            timeout: None,
            detached: true,
            remove_orphans: true,
            config_hashes: BTreeMap::new(),
        }
    }
}

/// A project bound to an engine
#[async_trait]
pub trait Project: Send + Sync {
    fn name(&self) -> &str;

    /// Services in dependency order
    fn services(&self) -> Vec<Arc<dyn EngineService>>;

    fn service(&self, name: &str) -> Option<Arc<dyn EngineService>> {
        self.services().into_iter().find(|s| s.name() == name)
    }

    /// Bring the project to its desired state
    async fn up(&self, request: UpRequest) -> Result<()>;
}

/// Factory binding resolved configuration to an engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Connect to the engine and construct the project
    async fn project(
        &self,
        name: &str,
        config: ComposeConfig,
        env: &Environment,
        client: &EngineClientConfig,
    ) -> Result<Arc<dyn Project>>;
}
