//! Convergence planning
//!
//! This module computes per-service content hashes and assembles the plan
//! tree returned by `up`.

pub mod metadata;
pub mod planner;

pub use metadata::{json_hash, ServiceMetadata};
pub use planner::{ConvergencePlanner, ConvergenceTree, ServicePlan};
