//! In-memory engine used by unit tests

use crate::compose::{ComposeConfig, ComposeLoader, ComposeService};
use crate::engine::{
    ConvergenceAction, ConvergencePlan, ConvergencePlanProvider, Engine, EngineClientConfig,
    EngineService, ImageInspectable, PlannedContainer, Project, Scalable, ServiceDescriptor,
    UpRequest, VolumesFrom,
};
use crate::env::Environment;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of what the fake engine was asked to do
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub struct FakeService {
    descriptor: ComposeService,
    image_id: Mutex<Option<String>>,
    image_lookup_fails: Mutex<bool>,
    last_plan_hash: Mutex<Option<String>>,
    failing_scale: Mutex<HashSet<u32>>,
    events: EventLog,
}

impl FakeService {
    pub fn set_image_id(&self, id: Option<&str>) {
        *self.image_id.lock().unwrap() = id.map(str::to_string);
    }

    /// Make image inspection fail the way an unreachable engine does
    pub fn fail_image_lookup(&self) {
        *self.image_lookup_fails.lock().unwrap() = true;
    }

    pub fn last_plan_hash(&self) -> Option<String> {
        self.last_plan_hash.lock().unwrap().clone()
    }

    /// Make `scale(replicas)` fail
    pub fn fail_scale_to(&self, replicas: u32) {
        self.failing_scale.lock().unwrap().insert(replicas);
    }
}

impl ServiceDescriptor for FakeService {
    fn name(&self) -> &str {
        self.descriptor.name()
    }

    fn image_name(&self) -> Option<&str> {
        self.descriptor.image_name()
    }

    fn options(&self) -> serde_json::Value {
        self.descriptor.options()
    }

    fn link_names(&self) -> Vec<(String, String)> {
        self.descriptor.link_names()
    }

    fn network_mode_id(&self) -> String {
        self.descriptor.network_mode_id()
    }

    fn networks(&self) -> BTreeMap<String, serde_json::Value> {
        self.descriptor.networks()
    }

    fn volumes_from(&self) -> Vec<VolumesFrom> {
        self.descriptor.volumes_from()
    }

    fn dependency_names(&self) -> Vec<String> {
        self.descriptor.dependency_names()
    }

    fn linked_service_names(&self) -> Vec<String> {
        self.descriptor.linked_service_names()
    }
}

#[async_trait]
impl ImageInspectable for FakeService {
    async fn image_id(&self) -> Result<Option<String>> {
        if *self.image_lookup_fails.lock().unwrap() {
            return Err(KeelError::Engine(format!("cannot inspect image of {}", self.name())));
        }
        Ok(self.image_id.lock().unwrap().clone())
    }
}

#[async_trait]
impl ConvergencePlanProvider for FakeService {
    async fn convergence_plan(&self, config_hash: &str) -> Result<ConvergencePlan> {
        *self.last_plan_hash.lock().unwrap() = Some(config_hash.to_string());
        self.events.lock().unwrap().push(format!("plan:{}", self.name()));
        Ok(ConvergencePlan {
            action: ConvergenceAction::Create,
            containers: vec![PlannedContainer {
                name: format!("{}-{}-1", self.descriptor.project(), self.name()),
                id: None,
            }],
        })
    }
}

#[async_trait]
impl Scalable for FakeService {
    async fn scale(&self, replicas: u32) -> Result<()> {
        if self.failing_scale.lock().unwrap().contains(&replicas) {
            return Err(KeelError::Engine(format!("cannot scale {}", self.name())));
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("scale:{}={}", self.name(), replicas));
        Ok(())
    }
}

pub struct FakeProject {
    name: String,
    services: Vec<Arc<FakeService>>,
    last_request: Mutex<Option<UpRequest>>,
    pub events: EventLog,
}

impl FakeProject {
    pub fn new(name: &str, config: &ComposeConfig, events: EventLog) -> Self {
        let services = ComposeService::from_config(name, config)
            .unwrap()
            .into_iter()
            .map(|descriptor| {
                Arc::new(FakeService {
                    descriptor,
                    image_id: Mutex::new(None),
                    image_lookup_fails: Mutex::new(false),
                    last_plan_hash: Mutex::new(None),
                    failing_scale: Mutex::new(HashSet::new()),
                    events: events.clone(),
                })
            })
            .collect();
        Self {
            name: name.to_string(),
            services,
            last_request: Mutex::new(None),
            events,
        }
    }

    pub fn from_manifest(name: &str, manifest: &str) -> Self {
        let config = ComposeLoader::parse_str(manifest).unwrap();
        Self::new(name, &config, EventLog::default())
    }

    pub fn fake(&self, name: &str) -> Arc<FakeService> {
        self.services
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<UpRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl Project for FakeProject {
    fn name(&self) -> &str {
        &self.name
    }

    fn services(&self) -> Vec<Arc<dyn EngineService>> {
        self.services
            .iter()
            .map(|s| s.clone() as Arc<dyn EngineService>)
            .collect()
    }

    async fn up(&self, request: UpRequest) -> Result<()> {
        self.events.lock().unwrap().push(format!(
            "apply:timeout={:?}:orphans={}:build={}",
            request.timeout, request.remove_orphans, request.build
        ));
        *self.last_request.lock().unwrap() = Some(request);
        Ok(())
    }
}

/// Engine handing out fake projects
#[derive(Default)]
pub struct FakeEngine {
    pub events: EventLog,
    pub unreachable: bool,
    /// `(service, replicas)` pairs whose scale fails on every project built
    pub failing_scale: Vec<(String, u32)>,
    pub last_project: Mutex<Option<Arc<FakeProject>>>,
    pub last_client: Mutex<Option<EngineClientConfig>>,
}

impl FakeEngine {
    pub fn built_project(&self) -> Arc<FakeProject> {
        self.last_project.lock().unwrap().clone().unwrap()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until `count` events were recorded or two seconds pass
    pub async fn wait_for_events(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            if self.events.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn project(
        &self,
        name: &str,
        config: ComposeConfig,
        _env: &Environment,
        client: &EngineClientConfig,
    ) -> Result<Arc<dyn Project>> {
        if self.unreachable {
            return Err(KeelError::Connection("engine is down".into()));
        }
        let project = Arc::new(FakeProject::new(name, &config, self.events.clone()));
        for (service, replicas) in &self.failing_scale {
            project.fake(service).fail_scale_to(*replicas);
        }
        *self.last_project.lock().unwrap() = Some(project.clone());
        *self.last_client.lock().unwrap() = Some(client.clone());
        Ok(project)
    }
}
