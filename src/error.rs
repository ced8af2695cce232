//! Error types for Keel

use thiserror::Error;

/// Result type for Keel operations
pub type Result<T> = std::result::Result<T, KeelError>;

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Couldn't connect to the engine: {0}")]
    Connection(String),

    #[error("Compose file parse error: {0}")]
    ConfigParse(String),

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Registry authentication failed: {0}")]
    Auth(String),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),
}

impl KeelError {
    /// Error name reported to RPC callers
    pub fn name(&self) -> &'static str {
        match self {
            KeelError::Connection(_) => "ConnectionError",
            KeelError::ConfigParse(_) | KeelError::Yaml(_) => "ConfigParseError",
            KeelError::RegistryUnavailable(_) => "RegistryUnavailable",
            KeelError::Auth(_) => "AuthError",
            KeelError::InvalidReference(_) => "InvalidReference",
            KeelError::ServiceNotFound(_) => "NoSuchService",
            KeelError::Engine(_) => "EngineError",
            KeelError::UnknownMethod(_) => "UnknownMethod",
            KeelError::InvalidParams(_) => "InvalidParams",
            KeelError::Io(_) | KeelError::Json(_) => "InternalError",
        }
    }

    /// Whether the registry could not produce an identifier for an image
    pub fn is_registry_failure(&self) -> bool {
        matches!(
            self,
            KeelError::RegistryUnavailable(_) | KeelError::Auth(_) | KeelError::InvalidReference(_)
        )
    }
}

impl From<serde_yaml::Error> for KeelError {
    fn from(e: serde_yaml::Error) -> Self {
        KeelError::Yaml(e.to_string())
    }
}
