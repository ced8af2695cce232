//! Compose manifest loading
//!
//! Turns the files and inline manifest of a request into one normalized
//! [`ComposeConfig`]: files are merged in order, the inline manifest is laid
//! on top, variables are interpolated and `env_file` entries are folded into
//! each service environment.

use super::config::{ComposeConfig, EnvValue, EnvironmentConfig};
use crate::env::Environment;
use crate::error::{KeelError, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Sources for one configuration load
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    /// Compose files, merged in order
    pub files: Vec<PathBuf>,
    /// Inline YAML manifest, merged last
    pub manifest: String,
}

impl ConfigSource {
    pub fn new(files: Vec<PathBuf>, manifest: impl Into<String>) -> Self {
        Self {
            files,
            manifest: manifest.into(),
        }
    }

    /// Directory relative paths (such as `env_file`) resolve against
    pub fn working_dir(&self) -> PathBuf {
        self.files
            .first()
            .and_then(|f| f.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Compose manifest loader
pub struct ComposeLoader;

impl ComposeLoader {
    /// Load, merge and normalize every source
    pub fn load(source: &ConfigSource, env: &Environment) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in &source.files {
            let content = std::fs::read_to_string(path).map_err(|e| {
                KeelError::ConfigParse(format!("Failed to read {}: {}", path.display(), e))
            })?;
            config = Self::merge(config, Self::parse_str(&content)?);
        }

        if !source.manifest.trim().is_empty() {
            config = Self::merge(config, Self::parse_str(&source.manifest)?);
        }

        if config.services.is_empty() {
            return Err(KeelError::ConfigParse(
                "Manifest does not define any services".to_string(),
            ));
        }

        Self::interpolate(&mut config, env);
        Self::resolve_environment(&mut config, env, &source.working_dir())?;
        Self::validate(&config)?;

        Ok(config)
    }

    /// Parse a compose document from a string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| KeelError::ConfigParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Merge two configurations; the overlay wins key by key
    pub fn merge(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            let Some(existing) = result.services.get_mut(&name) else {
                result.services.insert(name, service);
                continue;
            };

            macro_rules! overlay_field {
                ($($field:ident),*) => {
                    $(if service.$field.is_some() {
                        existing.$field = service.$field;
                    })*
                };
            }
            overlay_field!(
                image,
                build,
                environment,
                env_file,
                depends_on,
                links,
                external_links,
                volumes_from,
                networks,
                network_mode
            );
            existing.extra.extend(service.extra);
        }

        result.networks.extend(overlay.networks);
        result.volumes.extend(overlay.volumes);
        result.extra.extend(overlay.extra);

        result
    }

    /// Reject references to services that do not exist
    pub fn validate(config: &ComposeConfig) -> Result<()> {
        for (name, service) in &config.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(KeelError::ConfigParse(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            if let Some(depends) = &service.depends_on {
                for dep in depends.names() {
                    if !config.services.contains_key(&dep) {
                        return Err(KeelError::ConfigParse(format!(
                            "Service '{}' depends on unknown service '{}'",
                            name, dep
                        )));
                    }
                }
            }

            for link in service.links.iter().flatten() {
                let target = link.split(':').next().unwrap_or(link);
                if !config.services.contains_key(target) {
                    return Err(KeelError::ConfigParse(format!(
                        "Service '{}' has a link to unknown service '{}'",
                        name, target
                    )));
                }
            }
        }

        Ok(())
    }

    /// Interpolate `$VAR`, `${VAR}`, `${VAR:-default}` and `$$`
    pub fn interpolate(config: &mut ComposeConfig, env: &Environment) {
        for service in config.services.values_mut() {
            if let Some(image) = service.image.as_mut() {
                *image = interpolate_string(image, env);
            }
            if let Some(mode) = service.network_mode.as_mut() {
                *mode = interpolate_string(mode, env);
            }

            match service.environment.as_mut() {
                Some(EnvironmentConfig::Map(map)) => {
                    for value in map.values_mut().flatten() {
                        if let EnvValue::String(s) = value {
                            *s = interpolate_string(s, env);
                        }
                    }
                }
                Some(EnvironmentConfig::Array(arr)) => {
                    for item in arr.iter_mut() {
                        *item = interpolate_string(item, env);
                    }
                }
                None => {}
            }

            for value in service.extra.values_mut() {
                interpolate_value(value, env);
            }
        }
    }

    /// Normalize every service environment into mapping form
    ///
    /// `env_file` entries are read first and the inline environment is laid
    /// over them. Keys written without a value are filled from `env`, and
    /// dropped when `env` does not define them either.
    pub fn resolve_environment(
        config: &mut ComposeConfig,
        env: &Environment,
        working_dir: &Path,
    ) -> Result<()> {
        for (name, service) in config.services.iter_mut() {
            if service.env_file.is_none() && service.environment.is_none() {
                continue;
            }

            let mut resolved: BTreeMap<String, Option<EnvValue>> = BTreeMap::new();

            if let Some(files) = service.env_file.take() {
                for file in files.paths() {
                    let path = working_dir.join(file);
                    let content = std::fs::read_to_string(&path).map_err(|e| {
                        KeelError::ConfigParse(format!(
                            "Service '{}' env_file {}: {}",
                            name,
                            path.display(),
                            e
                        ))
                    })?;
                    for (key, value) in Environment::parse(&content).iter() {
                        resolved.insert(key.clone(), Some(EnvValue::String(value.clone())));
                    }
                }
            }

            match service.environment.take() {
                Some(EnvironmentConfig::Array(arr)) => {
                    for item in arr {
                        match item.split_once('=') {
                            Some((key, value)) => {
                                resolved.insert(key.to_string(), Some(EnvValue::String(value.to_string())));
                            }
                            None => {
                                resolved.insert(item, None);
                            }
                        }
                    }
                }
                Some(EnvironmentConfig::Map(map)) => resolved.extend(map),
                None => {}
            }

            let resolved: BTreeMap<String, Option<EnvValue>> = resolved
                .into_iter()
                .filter_map(|(key, value)| match value {
                    Some(v) => Some((key, Some(v))),
                    None => env
                        .get(&key)
                        .map(|v| (key.clone(), Some(EnvValue::String(v.to_string())))),
                })
                .collect();

            service.environment = Some(EnvironmentConfig::Map(resolved));
        }

        Ok(())
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?)-([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("variable pattern is valid")
    })
}

/// Interpolate environment variables in a string
pub fn interpolate_string(s: &str, env: &Environment) -> String {
    variable_pattern()
        .replace_all(s, |caps: &Captures| {
            if caps.get(1).is_some() {
                return "$".to_string();
            }
            let name = caps.get(2).or_else(|| caps.get(5)).map_or("", |m| m.as_str());
            let unset_if_empty = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
            match (env.get(name), caps.get(4)) {
                (Some(value), Some(default)) if value.is_empty() && unset_if_empty => {
                    default.as_str().to_string()
                }
                (Some(value), _) => value.to_string(),
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => String::new(),
            }
        })
        .into_owned()
}

fn interpolate_value(value: &mut serde_yaml::Value, env: &Environment) {
    match value {
        serde_yaml::Value::String(s) => *s = interpolate_string(s, env),
        serde_yaml::Value::Sequence(seq) => seq.iter_mut().for_each(|v| interpolate_value(v, env)),
        serde_yaml::Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| interpolate_value(v, env)),
        serde_yaml::Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env),
        _ => {}
    }
}
