//! Image registry client
//!
//! This module resolves symbolic image names to the identifiers published by
//! their registry, speaking both the legacy v1 and the token-authenticated
//! v2 API.

pub mod client;
pub mod reference;

pub use client::{HttpTransport, ImageResolver, RegistryClient, RegistryResponse, RegistryTransport};
pub use reference::{ImageReference, Separator};
