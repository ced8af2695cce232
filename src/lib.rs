//! Keel - a remote-control RPC layer for compose deployments
//!
//! Keel accepts compose manifests over a line-delimited JSON RPC and drives a
//! container engine on the caller's behalf:
//!
//! - `ping` liveness checks
//! - `config` manifest validation and rendering
//! - `up` convergence planning followed by a detached apply
//! - `scale` detached per-service scaling
//!
//! Image identifiers missing from the engine are resolved against the
//! registry so the convergence plan can hash them.

pub mod compose;
pub mod controller;
pub mod dispatch;
pub mod engine;
pub mod env;
pub mod error;
pub mod plan;
pub mod registry;
pub mod rpc;

#[cfg(test)]
mod testing;

pub use error::{KeelError, Result};
