//! Docker Compose manifest handling
//!
//! This module loads and normalizes compose manifests and exposes resolved
//! services to the planner.

pub mod config;
pub mod loader;
pub mod service;

pub use config::{ComposeConfig, ServiceConfig};
pub use loader::{ComposeLoader, ConfigSource};
pub use service::ComposeService;
