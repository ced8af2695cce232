//! Engine client configuration
//!
//! Derives the base URL, timeout and TLS bundle used to reach the engine
//! from the layered environment. Building a configuration never touches the
//! network or the filesystem; missing certificate files show up when the
//! client connects.

use crate::env::Environment;
use std::path::{Path, PathBuf};

/// Default engine HTTP timeout in seconds
pub const HTTP_TIMEOUT: u64 = 60;

/// Engine API version requested by the client
pub const API_VERSION: &str = "1.41";

/// Environment variables read by the builder
pub mod vars {
    pub const DOCKER_HOST: &str = "DOCKER_HOST";
    pub const DOCKER_CERT_PATH: &str = "DOCKER_CERT_PATH";
    pub const DOCKER_TLS_VERIFY: &str = "DOCKER_TLS_VERIFY";
    pub const COMPOSE_HTTP_TIMEOUT: &str = "COMPOSE_HTTP_TIMEOUT";
    pub const DOCKER_CLIENT_TIMEOUT: &str = "DOCKER_CLIENT_TIMEOUT";
    pub const COMPOSE_TLS_VERSION: &str = "COMPOSE_TLS_VERSION";
}

/// TLS settings for the engine connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub ca_cert: PathBuf,
    pub verify: bool,
    pub assert_hostname: bool,
    pub ssl_version: Option<String>,
}

/// Caller preferences that refine the derived TLS bundle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsPreferences {
    /// Overrides the hostname check implied by `DOCKER_TLS_VERIFY`
    pub assert_hostname: Option<bool>,
}

/// Engine client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineClientConfig {
    /// Engine address; `None` means the adapter default
    pub base_url: Option<String>,
    pub version: String,
    /// Request timeout in seconds
    pub timeout: u64,
    pub tls: Option<TlsBundle>,
}

impl EngineClientConfig {
    /// Derive a configuration from an optional host and the environment
    pub fn from_environment(host: Option<&str>, env: &Environment) -> Self {
        Self::with_preferences(host, env, &TlsPreferences::default())
    }

    pub fn with_preferences(host: Option<&str>, env: &Environment, prefs: &TlsPreferences) -> Self {
        let cert_path = env.get_non_empty(vars::DOCKER_CERT_PATH).map(PathBuf::from);
        let verify = env.get_non_empty(vars::DOCKER_TLS_VERIFY).is_some();
        let tls_enabled = cert_path.is_some() || verify;

        let host = host
            .filter(|h| !h.is_empty())
            .or_else(|| env.get_non_empty(vars::DOCKER_HOST))
            .map(|h| match h.strip_prefix("tcp://") {
                Some(rest) if tls_enabled => format!("https://{}", rest),
                _ => h.to_string(),
            });

        let mut config = Self {
            base_url: host,
            version: API_VERSION.to_string(),
            timeout: timeout_from(env),
            tls: None,
        };

        if !tls_enabled {
            return config;
        }

        let cert_path = cert_path.unwrap_or_else(default_cert_path);
        let assert_hostname = match prefs.assert_hostname {
            Some(assert) => assert,
            None => verify,
        };

        config.tls = Some(TlsBundle::in_dir(
            &cert_path,
            verify,
            assert_hostname,
            env.get_non_empty(vars::COMPOSE_TLS_VERSION).map(str::to_string),
        ));
        config
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

impl TlsBundle {
    fn in_dir(dir: &Path, verify: bool, assert_hostname: bool, ssl_version: Option<String>) -> Self {
        Self {
            client_cert: dir.join("cert.pem"),
            client_key: dir.join("key.pem"),
            ca_cert: dir.join("ca.pem"),
            verify,
            assert_hostname,
            ssl_version,
        }
    }
}

fn timeout_from(env: &Environment) -> u64 {
    [vars::COMPOSE_HTTP_TIMEOUT, vars::DOCKER_CLIENT_TIMEOUT]
        .iter()
        .filter_map(|key| env.get_non_empty(key))
        .find_map(|value| value.trim().parse().ok())
        .unwrap_or(HTTP_TIMEOUT)
}

/// Per-user certificate directory
pub fn default_cert_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".docker")
}
