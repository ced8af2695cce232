//! Orchestration controller
//!
//! The RPC-facing surface. Every call builds its environment, client
//! configuration and project from scratch. `up` and `scale` hand the
//! mutating work to detached tasks and return right away.
//!
//! No lock is taken per project: two concurrent `up` calls against the same
//! project race each other and the engine.

use crate::compose::{ComposeConfig, ComposeLoader, ConfigSource};
use crate::dispatch::TaskDispatcher;
use crate::engine::{Engine, EngineClientConfig, Project, TlsPreferences, UpRequest};
use crate::env::Environment;
use crate::error::{KeelError, Result};
use crate::plan::{ConvergencePlanner, ConvergenceTree};
use crate::registry::{ImageReference, ImageResolver};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Project name used when neither the caller nor the manifest names one
pub const DEFAULT_PROJECT_NAME: &str = "default";

/// Options shared by every project-level call
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectOptions {
    pub project_name: Option<String>,
    pub files: Vec<PathBuf>,
    /// `KEY=VALUE` lines
    pub environment: Option<String>,
    pub host: Option<String>,
    /// Accept engine certificates whose name does not match the host
    pub skip_hostname_check: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigOptions {
    #[serde(flatten)]
    pub project: ProjectOptions,
    pub resolve_image_digests: bool,
    pub quiet: bool,
    /// Only list service names
    pub services: bool,
    /// Only list volume names
    pub volumes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpOptions {
    #[serde(flatten)]
    pub project: ProjectOptions,
    /// Container stop timeout in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScaleTarget {
    pub name: String,
    pub num: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScaleOptions {
    #[serde(flatten)]
    pub project: ProjectOptions,
    pub services: Vec<ScaleTarget>,
}

/// Result of a `config` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigView {
    Config(ComposeConfig),
    Names(Vec<String>),
}

/// Everything resolved for one call before the engine is involved
struct CallContext {
    project_name: String,
    config: ComposeConfig,
    env: Environment,
    client: EngineClientConfig,
}

pub struct OrchestrationController {
    engine: Arc<dyn Engine>,
    resolver: Arc<dyn ImageResolver>,
    planner: ConvergencePlanner,
    dispatcher: TaskDispatcher,
}

impl OrchestrationController {
    pub fn new(engine: Arc<dyn Engine>, resolver: Arc<dyn ImageResolver>) -> Self {
        Self {
            engine,
            planner: ConvergencePlanner::new(resolver.clone()),
            resolver,
            dispatcher: TaskDispatcher::new(),
        }
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Liveness check
    pub fn ping(&self) -> &'static str {
        "pong"
    }

    /// Resolve configuration, optionally narrowed to names
    ///
    /// With `resolve_image_digests` every image is pinned to its manifest
    /// digest. Images the registry cannot pin keep their tag.
    pub async fn config(&self, options: ConfigOptions, manifest: &str) -> Result<Option<ConfigView>> {
        let mut ctx = self.context(&options.project, manifest)?;

        if options.resolve_image_digests {
            for (name, service) in ctx.config.services.iter_mut() {
                let Some(image) = service.image.clone() else {
                    continue;
                };
                match self.resolver.resolve_manifest_digest(&image).await {
                    Ok(digest) => {
                        let repository = ImageReference::parse(&image).repository;
                        service.image = Some(format!("{}@{}", repository, digest));
                    }
                    Err(e) if e.is_registry_failure() => {
                        warn!("Could not pin image {} for {}: {}", image, name, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if options.quiet {
            return Ok(None);
        }
        if options.services {
            return Ok(Some(ConfigView::Names(ctx.config.services.keys().cloned().collect())));
        }
        if options.volumes {
            return Ok(Some(ConfigView::Names(ctx.config.volumes.keys().cloned().collect())));
        }
        Ok(Some(ConfigView::Config(ctx.config)))
    }

    /// Plan the project, then apply it in the background
    ///
    /// The returned tree is complete before the apply task is dispatched.
    pub async fn up(&self, options: UpOptions, manifest: &str) -> Result<ConvergenceTree> {
        let ctx = self.context(&options.project, manifest)?;
        let project = self.bind(&ctx).await?;

        let tree = self.planner.build_tree(project.as_ref()).await?;
        info!("Planned {} services for project {}", tree.len(), project.name());

        let request = UpRequest {
            timeout: options.timeout,
            config_hashes: tree
                .iter()
                .map(|(name, plan)| (name.clone(), plan.hash.clone()))
                .collect(),
            ..UpRequest::default()
        };
        let label = format!("up:{}", project.name());
        self.dispatcher
            .dispatch(label, async move { project.up(request).await });

        Ok(tree)
    }

    /// Scale each requested service on its own detached task
    pub async fn scale(&self, options: ScaleOptions, manifest: &str) -> Result<()> {
        let ctx = self.context(&options.project, manifest)?;
        let project = self.bind(&ctx).await?;

        let mut targets = Vec::with_capacity(options.services.len());
        for target in &options.services {
            let service = project
                .service(&target.name)
                .ok_or_else(|| KeelError::ServiceNotFound(target.name.clone()))?;
            targets.push((service, target.num));
        }

        for (service, replicas) in targets {
            let label = format!("scale:{}={}", service.name(), replicas);
            self.dispatcher
                .dispatch(label, async move { service.scale(replicas).await });
        }

        Ok(())
    }

    fn context(&self, options: &ProjectOptions, manifest: &str) -> Result<CallContext> {
        let env = Environment::from_overrides(options.environment.as_deref().unwrap_or_default());
        let prefs = TlsPreferences {
            assert_hostname: options.skip_hostname_check.then_some(false),
        };
        let client = EngineClientConfig::with_preferences(options.host.as_deref(), &env, &prefs);

        let source = ConfigSource::new(options.files.clone(), manifest);
        let config = ComposeLoader::load(&source, &env)?;

        let project_name = options
            .project_name
            .as_deref()
            .or(config.name.as_deref())
            .map(normalize_project_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());

        debug!(
            "Resolved project {} with {} services",
            project_name,
            config.services.len()
        );

        Ok(CallContext {
            project_name,
            config,
            env,
            client,
        })
    }

    async fn bind(&self, ctx: &CallContext) -> Result<Arc<dyn Project>> {
        self.engine
            .project(&ctx.project_name, ctx.config.clone(), &ctx.env, &ctx.client)
            .await
    }
}

/// Lowercase and drop characters the engine rejects in project names
pub fn normalize_project_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::client::tests::{docker_hub_v2, MANIFEST_DIGEST};
    use crate::registry::RegistryClient;
    use crate::testing::FakeEngine;

    const MANIFEST: &str = r#"
name: Shop
services:
  db:
    image: postgres:16
  web:
    image: nginx
    depends_on: [db]
    environment:
      - TAG=${KEEL_TEST_TAG:-dev}
volumes:
  pgdata: {}
  cache: {}
"#;

    fn controller(engine: Arc<FakeEngine>) -> OrchestrationController {
        let registry = RegistryClient::with_transport(docker_hub_v2("library/nginx", "latest"));
        OrchestrationController::new(engine, Arc::new(registry))
    }

    #[test]
    fn test_ping() {
        let ctl = controller(Arc::new(FakeEngine::default()));
        assert_eq!(ctl.ping(), "pong");
    }

    #[test]
    fn test_options_defaults() {
        let opts: UpOptions = serde_json::from_str(r#"{"project_name": "shop"}"#).unwrap();
        assert_eq!(opts.project.project_name.as_deref(), Some("shop"));
        assert!(opts.project.files.is_empty());
        assert_eq!(opts.timeout, None);

        let scale: ScaleOptions =
            serde_json::from_str(r#"{"services": [{"name": "web", "num": 3}]}"#).unwrap();
        assert_eq!(scale.services[0], ScaleTarget { name: "web".into(), num: 3 });
    }

    #[tokio::test]
    async fn test_up_plans_before_apply() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());
        let options = UpOptions {
            timeout: Some(20),
            ..UpOptions::default()
        };

        let tree = ctl.up(options, MANIFEST).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree["web"].meta.image_id.starts_with("sha256:"));

        // Nothing has yielded to the runtime yet, so the apply cannot have run
        let at_return = engine.events();
        assert_eq!(at_return.len(), 2);
        assert!(at_return.iter().all(|e| e.starts_with("plan:")));

        let events = engine.wait_for_events(3).await;
        assert_eq!(events[2], "apply:timeout=Some(20):orphans=true:build=false");
        assert_eq!(ctl.dispatcher().dispatched(), 1);
        assert_eq!(engine.built_project().events().len(), 3);
    }

    #[tokio::test]
    async fn test_up_hands_planned_hashes_to_apply() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());

        let tree = ctl.up(UpOptions::default(), MANIFEST).await.unwrap();
        engine.wait_for_events(3).await;

        let request = engine.built_project().last_request().unwrap();
        assert_eq!(request.config_hashes.len(), 2);
        assert_eq!(request.config_hashes["web"], tree["web"].hash);
        assert_eq!(request.config_hashes["db"], tree["db"].hash);
    }

    #[tokio::test]
    async fn test_up_uses_manifest_project_name() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());

        let tree = ctl.up(UpOptions::default(), MANIFEST).await.unwrap();
        assert_eq!(tree["db"].plan.containers[0].name, "shop-db-1");
    }

    #[tokio::test]
    async fn test_malformed_manifest_aborts_before_engine() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());

        let err = ctl.up(UpOptions::default(), "services: [oops").await.unwrap_err();
        assert_eq!(err.name(), "ConfigParseError");
        assert!(engine.last_project.lock().unwrap().is_none());
        assert_eq!(ctl.dispatcher().dispatched(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_connection_error() {
        let engine = Arc::new(FakeEngine {
            unreachable: true,
            ..FakeEngine::default()
        });
        let ctl = controller(engine);

        let err = ctl.up(UpOptions::default(), MANIFEST).await.unwrap_err();
        assert!(matches!(err, KeelError::Connection(_)));
        assert_eq!(ctl.dispatcher().dispatched(), 0);
    }

    #[tokio::test]
    async fn test_scale_dispatches_one_task_per_target() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());

        let options = ScaleOptions {
            services: vec![
                ScaleTarget { name: "web".into(), num: 99 },
                ScaleTarget { name: "db".into(), num: 2 },
                ScaleTarget { name: "web".into(), num: 3 },
            ],
            ..ScaleOptions::default()
        };
        ctl.scale(options, MANIFEST).await.unwrap();
        assert_eq!(ctl.dispatcher().dispatched(), 3);

        let mut events = engine.wait_for_events(3).await;
        events.sort();
        assert_eq!(events, vec!["scale:db=2", "scale:web=3", "scale:web=99"]);
    }

    #[tokio::test]
    async fn test_scale_failure_does_not_block_other_targets() {
        let engine = Arc::new(FakeEngine {
            failing_scale: vec![("web".into(), 5)],
            ..FakeEngine::default()
        });
        let ctl = controller(engine.clone());
        let manifest = "services:\n  web:\n    image: nginx\n  worker:\n    image: busybox\n";
        let options = ScaleOptions {
            services: vec![
                ScaleTarget { name: "web".into(), num: 5 },
                ScaleTarget { name: "worker".into(), num: 4 },
            ],
            ..ScaleOptions::default()
        };

        ctl.scale(options, manifest).await.unwrap();
        assert_eq!(ctl.dispatcher().dispatched(), 2);

        let events = engine.wait_for_events(1).await;
        assert_eq!(events, vec!["scale:worker=4"]);
    }

    #[tokio::test]
    async fn test_scale_unknown_service_dispatches_nothing() {
        let ctl = controller(Arc::new(FakeEngine::default()));
        let options = ScaleOptions {
            services: vec![
                ScaleTarget { name: "web".into(), num: 2 },
                ScaleTarget { name: "ghost".into(), num: 1 },
            ],
            ..ScaleOptions::default()
        };

        let err = ctl.scale(options, MANIFEST).await.unwrap_err();
        assert!(matches!(err, KeelError::ServiceNotFound(ref n) if n == "ghost"));
        assert_eq!(ctl.dispatcher().dispatched(), 0);
    }

    #[tokio::test]
    async fn test_config_views() {
        let ctl = controller(Arc::new(FakeEngine::default()));

        let quiet = ConfigOptions {
            quiet: true,
            ..ConfigOptions::default()
        };
        assert_eq!(ctl.config(quiet, MANIFEST).await.unwrap(), None);

        let services = ConfigOptions {
            services: true,
            ..ConfigOptions::default()
        };
        assert_eq!(
            ctl.config(services, MANIFEST).await.unwrap(),
            Some(ConfigView::Names(vec!["db".into(), "web".into()]))
        );

        let volumes = ConfigOptions {
            volumes: true,
            ..ConfigOptions::default()
        };
        assert_eq!(
            ctl.config(volumes, MANIFEST).await.unwrap(),
            Some(ConfigView::Names(vec!["cache".into(), "pgdata".into()]))
        );
    }

    #[tokio::test]
    async fn test_config_interpolates_caller_environment() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());
        let options = ConfigOptions {
            project: ProjectOptions {
                environment: Some("KEEL_TEST_TAG=v7".into()),
                ..ProjectOptions::default()
            },
            ..ConfigOptions::default()
        };

        let Some(ConfigView::Config(config)) = ctl.config(options, MANIFEST).await.unwrap() else {
            panic!("expected full configuration");
        };
        let json = serde_json::to_value(&config.services["web"]).unwrap();
        assert_eq!(json["environment"]["TAG"], "v7");
        // Plain config does not need the engine
        assert!(engine.last_project.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_resolves_image_digests() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());
        let options = ConfigOptions {
            resolve_image_digests: true,
            ..ConfigOptions::default()
        };

        let Some(ConfigView::Config(config)) = ctl.config(options, MANIFEST).await.unwrap() else {
            panic!("expected full configuration");
        };
        let web = config.services["web"].image.as_deref().unwrap();
        assert_eq!(web, format!("nginx@{}", MANIFEST_DIGEST));
        // postgres is unknown to the fake registry and keeps its tag
        assert_eq!(config.services["db"].image.as_deref(), Some("postgres:16"));
        assert!(engine.last_project.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_host_option_reaches_engine_config() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());
        let options = UpOptions {
            project: ProjectOptions {
                host: Some("tcp://10.1.2.3:2375".into()),
                ..ProjectOptions::default()
            },
            ..UpOptions::default()
        };

        ctl.up(options, MANIFEST).await.unwrap();
        let client = engine.last_client.lock().unwrap().clone().unwrap();
        assert!(client.base_url.unwrap().ends_with("10.1.2.3:2375"));
    }

    #[tokio::test]
    async fn test_skip_hostname_check_reaches_tls_bundle() {
        let engine = Arc::new(FakeEngine::default());
        let ctl = controller(engine.clone());
        let options = UpOptions {
            project: ProjectOptions {
                host: Some("tcp://10.1.2.3:2376".into()),
                environment: Some("DOCKER_TLS_VERIFY=1\nDOCKER_CERT_PATH=/etc/keel/certs".into()),
                skip_hostname_check: true,
                ..ProjectOptions::default()
            },
            ..UpOptions::default()
        };

        ctl.up(options, MANIFEST).await.unwrap();
        let client = engine.last_client.lock().unwrap().clone().unwrap();
        let tls = client.tls.unwrap();
        assert!(tls.verify);
        assert!(!tls.assert_hostname);
    }

    #[test]
    fn test_normalize_project_name() {
        assert_eq!(normalize_project_name("My Shop!"), "myshop");
        assert_eq!(normalize_project_name("api_v2-stage"), "api_v2-stage");
    }
}
