//! Docker engine adapter
//!
//! Reads go to the Docker Engine API through bollard: ping, image inspection
//! and the label-filtered container list that convergence decisions are made
//! from. Mutations are delegated to the `docker compose` CLI, which receives
//! the normalized manifest on stdin.
//!
//! Keel stamps its own configuration hash on every service it applies, as the
//! `io.keel.config-hash` label. The CLI keeps a hash of its own in a separate
//! label, so only Keel's label is comparable with the planner's hash.
//!
//! Over TLS, bollard always verifies the engine certificate against `ca.pem`.
//! The bundle's `verify`, `assert_hostname` and `ssl_version` flags are not
//! applied to this read path.

use super::client::{vars, EngineClientConfig};
use super::{
    ConvergenceAction, ConvergencePlan, ConvergencePlanProvider, Engine, EngineService,
    ImageInspectable, PlannedContainer, Project, Scalable, ServiceDescriptor, UpRequest,
    VolumesFrom,
};
use crate::compose::{ComposeConfig, ComposeService};
use crate::env::Environment;
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::{ClientVersion, Docker};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Engine socket used when neither the caller nor `DOCKER_HOST` names one
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Labels on engine containers
pub mod labels {
    pub const PROJECT: &str = "com.docker.compose.project";
    pub const SERVICE: &str = "com.docker.compose.service";
    pub const ONEOFF: &str = "com.docker.compose.oneoff";
    /// Planner hash of the configuration a container was applied from
    pub const KEEL_CONFIG_HASH: &str = "io.keel.config-hash";
}

/// How the engine is reached
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(String),
    Http(String),
    Tls(String),
}

/// Pick the engine endpoint for a client configuration
fn endpoint(config: &EngineClientConfig) -> Result<Endpoint> {
    let host = match config.base_url.as_deref() {
        None => return Ok(Endpoint::Unix(DEFAULT_SOCKET.to_string())),
        Some(host) => host.trim_end_matches('/'),
    };

    if let Some(path) = host.strip_prefix("unix://") {
        return Ok(Endpoint::Unix(path.to_string()));
    }
    if host.starts_with("npipe://") {
        return Err(KeelError::Connection(format!(
            "{}: named pipes are not supported",
            host
        )));
    }

    let address = ["tcp://", "https://", "http://"]
        .iter()
        .find_map(|scheme| host.strip_prefix(scheme))
        .unwrap_or(host);

    if config.tls_enabled() {
        Ok(Endpoint::Tls(format!("tcp://{}", address)))
    } else if host.starts_with("https://") {
        Err(KeelError::Connection(format!(
            "{} needs TLS; set DOCKER_CERT_PATH or DOCKER_TLS_VERIFY",
            host
        )))
    } else {
        Ok(Endpoint::Http(format!("http://{}", address)))
    }
}

/// `1.41` style version string; malformed values fall back to bollard's default
fn client_version(version: &str) -> ClientVersion {
    version
        .split_once('.')
        .and_then(|(major, minor)| {
            Some(ClientVersion {
                major_version: major.parse().ok()?,
                minor_version: minor.parse().ok()?,
            })
        })
        .unwrap_or_else(|| bollard::API_DEFAULT_VERSION.clone())
}

fn engine_error(e: bollard::errors::Error) -> KeelError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => KeelError::Engine(format!("{} ({})", message, status_code)),
        other => KeelError::Connection(other.to_string()),
    }
}

/// Container of a service as the planner sees it
#[derive(Debug, Clone, PartialEq)]
struct ServiceContainer {
    id: String,
    name: String,
    running: bool,
    labels: HashMap<String, String>,
}

impl ServiceContainer {
    fn from_summary(summary: bollard::models::ContainerSummary) -> Self {
        let id = summary.id.unwrap_or_default();
        let name = summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| id.clone());

        Self {
            name,
            running: summary.state.as_deref() == Some("running"),
            labels: summary.labels.unwrap_or_default(),
            id,
        }
    }

    fn config_hash(&self) -> Option<&str> {
        self.labels.get(labels::KEEL_CONFIG_HASH).map(String::as_str)
    }

    fn planned(&self) -> PlannedContainer {
        PlannedContainer {
            name: self.name.clone(),
            id: Some(self.id.clone()),
        }
    }
}

/// Read-only connection to the engine API
pub struct EngineConnection {
    docker: Docker,
}

impl EngineConnection {
    /// Build a client from an engine client configuration
    ///
    /// Certificates are read here; nothing is sent to the engine.
    pub fn connect(config: &EngineClientConfig) -> Result<Self> {
        let version = client_version(&config.version);
        let docker = match endpoint(config)? {
            Endpoint::Unix(path) => Docker::connect_with_unix(&path, config.timeout, &version),
            Endpoint::Http(address) => Docker::connect_with_http(&address, config.timeout, &version),
            Endpoint::Tls(address) => {
                let tls = config.tls.as_ref().ok_or_else(|| {
                    KeelError::Connection(format!("{} needs a TLS bundle", address))
                })?;
                Docker::connect_with_ssl(
                    &address,
                    &tls.client_key,
                    &tls.client_cert,
                    &tls.ca_cert,
                    config.timeout,
                    &version,
                )
            }
        }
        .map_err(|e| KeelError::Connection(e.to_string()))?;

        Ok(Self { docker })
    }

    /// Check that the engine answers
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| KeelError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<String>> {
        match self.docker.inspect_image(name).await {
            Ok(image) => Ok(image.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(engine_error(e)),
        }
    }

    async fn service_containers(&self, project: &str, service: &str) -> Result<Vec<ServiceContainer>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{}={}", labels::PROJECT, project),
                format!("{}={}", labels::SERVICE, service),
                format!("{}=False", labels::ONEOFF),
            ],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let mut containers: Vec<ServiceContainer> = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(engine_error)?
            .into_iter()
            .map(ServiceContainer::from_summary)
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }
}

/// Copy of `config` with each listed service's hash stamped as a label
fn stamp_config_hashes(config: &ComposeConfig, hashes: &BTreeMap<String, String>) -> ComposeConfig {
    let mut stamped = config.clone();
    for (name, service) in stamped.services.iter_mut() {
        let Some(hash) = hashes.get(name) else {
            continue;
        };

        let entry = service
            .extra
            .entry("labels".to_string())
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        match entry {
            Value::Sequence(items) => {
                let prefix = format!("{}=", labels::KEEL_CONFIG_HASH);
                items.retain(|item| !item.as_str().is_some_and(|s| s.starts_with(&prefix)));
                items.push(Value::String(format!("{}{}", prefix, hash)));
            }
            Value::Mapping(map) => {
                map.insert(
                    Value::String(labels::KEEL_CONFIG_HASH.to_string()),
                    Value::String(hash.clone()),
                );
            }
            other => {
                let mut map = Mapping::new();
                map.insert(
                    Value::String(labels::KEEL_CONFIG_HASH.to_string()),
                    Value::String(hash.clone()),
                );
                *other = Value::Mapping(map);
            }
        }
    }
    stamped
}

/// Invocation of the `docker compose` CLI for one project
pub struct ComposeCli {
    program: String,
    project: String,
    config: ComposeConfig,
    env: BTreeMap<String, String>,
}

impl ComposeCli {
    pub fn new(project: &str, config: &ComposeConfig, env: &Environment, client: &EngineClientConfig) -> Self {
        let mut vars = env.as_map().clone();
        if let Some(host) = &client.base_url {
            let host = match host.strip_prefix("https://") {
                Some(rest) => format!("tcp://{}", rest),
                None => host.clone(),
            };
            vars.insert(vars::DOCKER_HOST.to_string(), host);
        }

        Self {
            program: "docker".to_string(),
            project: project.to_string(),
            config: config.clone(),
            env: vars,
        }
    }

    /// Manifest handed to the CLI, carrying the given service hashes
    pub fn manifest(&self, hashes: &BTreeMap<String, String>) -> Result<String> {
        Ok(serde_yaml::to_string(&stamp_config_hashes(&self.config, hashes))?)
    }

    fn base_args(&self) -> Vec<String> {
        ["compose", "-p", self.project.as_str(), "-f", "-"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Arguments for a project `up`
    ///
    /// The CLI's default strategy recreates only changed containers.
    pub fn up_args(&self, request: &UpRequest) -> Vec<String> {
        let mut args = self.base_args();
        args.push("up".to_string());
        if request.detached {
            args.push("-d".to_string());
        }
        if request.remove_orphans {
            args.push("--remove-orphans".to_string());
        }
        args.push(if request.build { "--build" } else { "--no-build" }.to_string());
        if !request.start_deps {
            args.push("--no-deps".to_string());
        }
        if let Some(timeout) = request.timeout {
            args.push("--timeout".to_string());
            args.push(timeout.to_string());
        }
        args.extend(request.services.iter().cloned());
        args
    }

    /// Arguments for scaling one service
    pub fn scale_args(&self, service: &str, replicas: u32) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            [
                "up",
                "-d",
                "--no-deps",
                "--no-recreate",
                "--no-build",
                "--scale",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(format!("{}={}", service, replicas));
        args.push(service.to_string());
        args
    }

    async fn run(&self, args: Vec<String>, manifest: String) -> Result<()> {
        debug!("Running {} {}", self.program, args.join(" "));

        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(manifest.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(KeelError::Engine(format!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Service bound to a Docker engine
pub struct DockerService {
    descriptor: ComposeService,
    engine: Arc<EngineConnection>,
    cli: Arc<ComposeCli>,
}

impl DockerService {
    /// Replica count the manifest asks for
    fn desired_replicas(&self) -> u64 {
        let extra = &self.descriptor.config().extra;
        extra
            .get("scale")
            .and_then(|v| v.as_u64())
            .or_else(|| {
                extra
                    .get("deploy")
                    .and_then(|d| d.get("replicas"))
                    .and_then(|v| v.as_u64())
            })
            .unwrap_or(1)
    }

    fn container_name(&self, number: u64) -> String {
        format!("{}-{}-{}", self.descriptor.project(), self.descriptor.name(), number)
    }

    async fn containers(&self) -> Result<Vec<ServiceContainer>> {
        self.engine
            .service_containers(self.descriptor.project(), self.descriptor.name())
            .await
    }
}

impl ServiceDescriptor for DockerService {
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
impl ImageInspectable for DockerService {
    async fn image_id(&self) -> Result<Option<String>> {
        match self.descriptor.image_name() {
            Some(image) => self.engine.inspect_image(image).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ConvergencePlanProvider for DockerService {
    async fn convergence_plan(&self, config_hash: &str) -> Result<ConvergencePlan> {
        let containers = self.containers().await?;

        if containers.is_empty() {
            let planned = (1..=self.desired_replicas())
                .map(|n| PlannedContainer {
                    name: self.container_name(n),
                    id: None,
                })
                .collect();
            return Ok(ConvergencePlan {
                action: ConvergenceAction::Create,
                containers: planned,
            });
        }

        Ok(ConvergencePlan {
            action: existing_action(&containers, config_hash),
            containers: containers.iter().map(ServiceContainer::planned).collect(),
        })
    }
}

/// Action for a service that already has containers
fn existing_action(containers: &[ServiceContainer], config_hash: &str) -> ConvergenceAction {
    if containers.iter().any(|c| c.config_hash() != Some(config_hash)) {
        ConvergenceAction::Recreate
    } else if containers.iter().any(|c| !c.running) {
        ConvergenceAction::Start
    } else {
        ConvergenceAction::Noop
    }
}

#[async_trait]
impl Scalable for DockerService {
    /// New replicas carry the hash of the containers already running
    async fn scale(&self, replicas: u32) -> Result<()> {
        info!("Scaling {} to {} replicas", self.descriptor.name(), replicas);

        let hashes: BTreeMap<String, String> = self
            .containers()
            .await?
            .iter()
            .find_map(|c| c.config_hash().map(str::to_string))
            .map(|hash| (self.descriptor.name().to_string(), hash))
            .into_iter()
            .collect();

        let manifest = self.cli.manifest(&hashes)?;
        self.cli
            .run(self.cli.scale_args(self.descriptor.name(), replicas), manifest)
            .await
    }
}

/// Project bound to a Docker engine
pub struct DockerProject {
    name: String,
    services: Vec<Arc<DockerService>>,
    cli: Arc<ComposeCli>,
}

#[async_trait]
impl Project for DockerProject {
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
        info!("Bringing up project {}", self.name);
        let manifest = self.cli.manifest(&request.config_hashes)?;
        self.cli.run(self.cli.up_args(&request), manifest).await
    }
}

/// Engine factory for a Docker daemon
#[derive(Debug, Clone, Default)]
pub struct DockerEngine;

impl DockerEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn project(
        &self,
        name: &str,
        config: ComposeConfig,
        env: &Environment,
        client: &EngineClientConfig,
    ) -> Result<Arc<dyn Project>> {
        let engine = Arc::new(EngineConnection::connect(client)?);
        engine.ping().await?;

        let cli = Arc::new(ComposeCli::new(name, &config, env, client));
        let services = ComposeService::from_config(name, &config)?
            .into_iter()
            .map(|descriptor| {
                Arc::new(DockerService {
                    descriptor,
                    engine: engine.clone(),
                    cli: cli.clone(),
                })
            })
            .collect();

        Ok(Arc::new(DockerProject {
            name: name.to_string(),
            services,
            cli,
        }))
    }
}
