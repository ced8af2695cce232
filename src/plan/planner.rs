//! Convergence planning
//!
//! Builds the per-service plan returned to `up` callers before anything is
//! applied. Planning only reads: it inspects images, asks the registry and
//! asks the engine what it would do.

use super::metadata::ServiceMetadata;
use crate::engine::{ConvergencePlan, EngineService, Project};
use crate::error::Result;
use crate::registry::ImageResolver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Plan for one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServicePlan {
    #[serde(skip)]
    pub name: String,
    pub plan: ConvergencePlan,
    pub hash: String,
    pub meta: ServiceMetadata,
    pub dependencies: Vec<String>,
    pub links: Vec<String>,
    pub volumes: Vec<String>,
}

/// Service name to plan; a snapshot taken at planning time
pub type ConvergenceTree = BTreeMap<String, ServicePlan>;

/// Builds convergence plans for project services
#[derive(Clone)]
pub struct ConvergencePlanner {
    resolver: Arc<dyn ImageResolver>,
}

impl ConvergencePlanner {
    pub fn new(resolver: Arc<dyn ImageResolver>) -> Self {
        Self { resolver }
    }

    /// Identifier of the image a service runs
    ///
    /// The engine's local image wins; otherwise the registry is asked. A
    /// registry failure degrades to an empty identifier for this service
    /// only.
    pub async fn image_identifier(&self, service: &dyn EngineService) -> String {
        match service.image_id().await {
            Ok(Some(id)) => return id,
            Ok(None) => {}
            Err(e) => debug!("Engine has no image for {}: {}", service.name(), e),
        }

        let Some(image) = service.image_name() else {
            return String::new();
        };

        match self.resolver.resolve_image_identifier(image).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not resolve image {} for {}: {}", image, service.name(), e);
                String::new()
            }
        }
    }

    /// Plan a single service
    pub async fn build_plan(&self, service: &dyn EngineService) -> Result<ServicePlan> {
        let image_id = self.image_identifier(service).await;
        let meta = ServiceMetadata::describe(service, &image_id);
        let hash = meta.content_hash();
        let plan = service.convergence_plan(&hash).await?;

        debug!("Planned {}: {} ({})", service.name(), plan.action, hash);

        Ok(ServicePlan {
            name: service.name().to_string(),
            plan,
            hash,
            meta,
            dependencies: service.dependency_names(),
            links: service.linked_service_names(),
            volumes: service.volumes_from_names(),
        })
    }

    /// Plan every service of a project
    pub async fn build_tree(&self, project: &dyn Project) -> Result<ConvergenceTree> {
        let mut tree = ConvergenceTree::new();
        for service in project.services() {
            let plan = self.build_plan(service.as_ref()).await?;
            tree.insert(plan.name.clone(), plan);
        }
        Ok(tree)
    }
}
