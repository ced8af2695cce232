//! Resolved view of a compose service
//!
//! `ComposeService` answers the read-only questions the planner asks about a
//! service: its declared options, links, networks and volume sources. Engine
//! adapters wrap it and add the capabilities that need a live engine.

use super::config::{ComposeConfig, ServiceConfig};
use crate::engine::{ServiceDescriptor, VolumeSource, VolumesFrom};
use crate::error::{KeelError, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Network attached to services that do not name any
pub const DEFAULT_NETWORK: &str = "default";

/// A service within a resolved project
#[derive(Debug, Clone)]
pub struct ComposeService {
    project: String,
    name: String,
    config: ServiceConfig,
    peers: BTreeSet<String>,
}

impl ComposeService {
    pub fn new(project: &str, name: &str, config: ServiceConfig, peers: BTreeSet<String>) -> Self {
        Self {
            project: project.to_string(),
            name: name.to_string(),
            config,
            peers,
        }
    }

    /// Every service of a configuration, dependencies first
    pub fn from_config(project: &str, config: &ComposeConfig) -> Result<Vec<ComposeService>> {
        let peers: BTreeSet<String> = config.services.keys().cloned().collect();
        let services: BTreeMap<String, ComposeService> = config
            .services
            .iter()
            .map(|(name, svc)| {
                let service = ComposeService::new(project, name, svc.clone(), peers.clone());
                (name.clone(), service)
            })
            .collect();

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        for name in services.keys() {
            topological_sort(name, &services, &mut visited, &mut visiting, &mut order)?;
        }

        let mut services = services;
        Ok(order
            .into_iter()
            .filter_map(|name| services.remove(&name))
            .collect())
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn is_peer(&self, name: &str) -> bool {
        self.peers.contains(name)
    }

    /// `(service, alias)` pairs declared under `links`
    fn links(&self) -> Vec<(String, String)> {
        self.config
            .links
            .iter()
            .flatten()
            .map(|link| match link.split_once(':') {
                Some((service, alias)) => (service.to_string(), alias.to_string()),
                None => (link.clone(), link.clone()),
            })
            .collect()
    }

    fn network_names(&self) -> Vec<String> {
        match &self.config.networks {
            Some(networks) => networks.names(),
            None => vec![DEFAULT_NETWORK.to_string()],
        }
    }

    fn full_network_name(&self, network: &str) -> String {
        format!("{}_{}", self.project, network)
    }

    fn network_service(&self) -> Option<String> {
        self.config
            .network_mode
            .as_deref()
            .and_then(|mode| mode.strip_prefix("service:"))
            .map(str::to_string)
    }
}

impl ServiceDescriptor for ComposeService {
    fn name(&self) -> &str {
        &self.name
    }

    fn image_name(&self) -> Option<&str> {
        self.config.image.as_deref()
    }

    fn options(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }

    fn link_names(&self) -> Vec<(String, String)> {
        self.links()
    }

    fn network_mode_id(&self) -> String {
        if let Some(mode) = &self.config.network_mode {
            return mode.clone();
        }
        self.network_names()
            .first()
            .map(|n| self.full_network_name(n))
            .unwrap_or_else(|| "none".to_string())
    }

    fn networks(&self) -> BTreeMap<String, serde_json::Value> {
        if self.config.network_mode.is_some() {
            return BTreeMap::new();
        }
        self.network_names()
            .into_iter()
            .map(|name| {
                let attachment = self
                    .config
                    .networks
                    .as_ref()
                    .and_then(|n| n.attachment(&name))
                    .and_then(|v| serde_json::to_value(v).ok())
                    .unwrap_or(serde_json::Value::Null);
                (self.full_network_name(&name), attachment)
            })
            .collect()
    }

    fn volumes_from(&self) -> Vec<VolumesFrom> {
        self.config
            .volumes_from
            .iter()
            .flatten()
            .map(|spec| {
                let parts: Vec<&str> = spec.split(':').collect();
                let (source, mode) = match parts.as_slice() {
                    ["container", name] => (VolumeSource::Container(name.to_string()), "rw"),
                    ["container", name, mode] => (VolumeSource::Container(name.to_string()), *mode),
                    [name, mode] if self.is_peer(name) => (VolumeSource::Service(name.to_string()), *mode),
                    [name] if self.is_peer(name) => (VolumeSource::Service(name.to_string()), "rw"),
                    [name, mode] => (VolumeSource::Container(name.to_string()), *mode),
                    _ => (VolumeSource::Container(spec.clone()), "rw"),
                };
                VolumesFrom {
                    source,
                    mode: mode.to_string(),
                }
            })
            .collect()
    }

    fn dependency_names(&self) -> Vec<String> {
        let mut names = self.linked_service_names();
        names.extend(self.volumes_from_names());
        names.extend(self.network_service());
        if let Some(depends) = &self.config.depends_on {
            names.extend(depends.names());
        }
        names
    }

    fn linked_service_names(&self) -> Vec<String> {
        self.links().into_iter().map(|(service, _)| service).collect()
    }
}

fn dependencies_of(service: &ComposeService) -> Vec<String> {
    service
        .dependency_names()
        .into_iter()
        .filter(|dep| service.is_peer(dep))
        .collect()
}

fn topological_sort(
    name: &str,
    services: &BTreeMap<String, ComposeService>,
    visited: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(name) {
        return Ok(());
    }

    if visiting.contains(name) {
        return Err(KeelError::ConfigParse(format!(
            "Circular dependency detected for service: {}",
            name
        )));
    }

    visiting.insert(name.to_string());

    if let Some(service) = services.get(name) {
        for dep in dependencies_of(service) {
            topological_sort(&dep, services, visited, visiting, order)?;
        }
    }

    visiting.remove(name);
    visited.insert(name.to_string());
    order.push(name.to_string());

    Ok(())
}
