//! Docker Compose configuration types
//!
//! Only the fields Keel inspects are typed. Everything else in a service or
//! at the top level is carried through untouched in `extra`, so a manifest
//! handed back to the engine keeps every key the caller wrote.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Docker Compose file configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Option<serde_yaml::Value>>,
    /// Volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<serde_yaml::Value>>,
    /// Secrets, configs and extension fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<serde_yaml::Value>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Environment files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Links to other services (`service` or `service:alias`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
    /// Links to containers outside the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_links: Option<Vec<String>>,
    /// Volume sources (`service[:mode]` or `container:name[:mode]`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes_from: Option<Vec<String>>,
    /// Networks to connect to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    /// Network mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Every other service key
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// `KEY=VALUE` list
    Array(Vec<String>),
    /// Mapping; a null value means "take it from the environment"
    Map(BTreeMap<String, Option<EnvValue>>),
}

/// Scalar environment value as written in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    String(String),
    Number(serde_yaml::Number),
    Bool(bool),
}

/// Environment file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    Single(String),
    Multiple(Vec<String>),
}

impl EnvFileConfig {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            EnvFileConfig::Single(p) => vec![p.as_str()],
            EnvFileConfig::Multiple(ps) => ps.iter().map(String::as_str).collect(),
        }
    }
}

/// Depends on configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOnConfig {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Networks configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    Array(Vec<String>),
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
}

impl NetworksConfig {
    pub fn names(&self) -> Vec<String> {
        match self {
            NetworksConfig::Array(arr) => arr.clone(),
            NetworksConfig::Map(map) => map.keys().cloned().collect(),
        }
    }

    /// Per-network attachment settings, empty when none were given
    pub fn attachment(&self, name: &str) -> Option<serde_yaml::Value> {
        match self {
            NetworksConfig::Array(_) => None,
            NetworksConfig::Map(map) => map.get(name).cloned().flatten(),
        }
    }
}
