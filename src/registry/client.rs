//! Registry client
//!
//! Resolves an image name to the identifier its registry publishes. Modern
//! registries speak API v2 and hand out anonymous pull tokens; registries
//! answering the v2 version check with 404 are treated as v1 and return a plain text
//! image id instead of a digest.
//!
//! Two identifiers come out of a v2 manifest: the image config digest in the
//! body, which is what a local image's id is, and the manifest digest in the
//! `Docker-Content-Digest` header, which is what `repo@digest` pulls by.

use super::reference::{ImageReference, Separator};
use crate::error::{KeelError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Registry media types
pub mod media_types {
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
}

/// Header carrying the manifest digest
pub const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

/// Status, headers and body of a registry response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryResponse {
    pub status: u16,
    /// Header values keyed by lowercase name
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl RegistryResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// HTTP GET against a registry
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<RegistryResponse>;
}

/// Transport over reqwest
///
/// No request timeout is configured; registry calls rely on the
/// transport defaults.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<RegistryResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| KeelError::RegistryUnavailable(format!("{}: {}", url, e)))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| KeelError::RegistryUnavailable(format!("{}: {}", url, e)))?;

        Ok(RegistryResponse {
            status,
            headers,
            body,
        })
    }
}

/// Anything that can turn an image name into an identifier
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve_image_identifier(&self, name: &str) -> Result<String>;

    /// Digest a `repo@digest` reference can be pulled by
    async fn resolve_manifest_digest(&self, name: &str) -> Result<String>;
}

/// Token response from auth server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestConfig {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    config: ManifestConfig,
}

/// Registry client for resolving image identifiers
pub struct RegistryClient<T = HttpTransport> {
    transport: T,
}

impl RegistryClient<HttpTransport> {
    pub fn new() -> Self {
        Self::with_transport(HttpTransport::new())
    }
}

impl Default for RegistryClient<HttpTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RegistryTransport> RegistryClient<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    /// Resolve a symbolic image name to its registry identifier
    pub async fn resolve(&self, name: &str) -> Result<String> {
        let reference = ImageReference::parse(name);
        let (registry, repo) = reference.resolve()?;

        if self.v2_status(&registry).await? == 404 {
            self.image_id_v1(&registry, &repo, reference.tag()).await
        } else {
            self.image_id_v2(&registry, &repo, reference.tag()).await
        }
    }

    /// Resolve a symbolic image name to its manifest digest
    ///
    /// A name already pinned by digest is returned as is. v1 registries
    /// publish no manifest digests.
    pub async fn manifest_digest(&self, name: &str) -> Result<String> {
        let reference = ImageReference::parse(name);
        if reference.separator == Separator::Digest {
            return Ok(reference.tag().to_string());
        }
        let (registry, repo) = reference.resolve()?;

        if self.v2_status(&registry).await? == 404 {
            return Err(KeelError::RegistryUnavailable(format!(
                "{} only speaks registry API v1, which has no manifest digests",
                registry
            )));
        }

        let response = self.manifest_v2(&registry, &repo, reference.tag()).await?;
        response
            .header(CONTENT_DIGEST_HEADER)
            .map(str::to_string)
            .ok_or_else(|| {
                KeelError::RegistryUnavailable(format!("No manifest digest for {}", name))
            })
    }

    async fn v2_status(&self, registry: &str) -> Result<u16> {
        let url = format!("http://index.{}/v2", registry);
        let response = self.transport.get(&url, &[]).await?;
        debug!("Registry version check {} answered {}", url, response.status);
        Ok(response.status)
    }

    /// Legacy v1 lookup; the body is returned as is
    async fn image_id_v1(&self, registry: &str, repo: &str, tag: &str) -> Result<String> {
        let url = format!("https://index.{}/v1/repositories/{}/tags/{}", registry, repo, tag);
        let response = self.transport.get(&url, &[]).await?;

        if !response.is_success() {
            return Err(KeelError::RegistryUnavailable(format!(
                "{} answered {}",
                url, response.status
            )));
        }
        Ok(response.body)
    }

    async fn image_id_v2(&self, registry: &str, repo: &str, tag: &str) -> Result<String> {
        let response = self.manifest_v2(registry, repo, tag).await?;
        let manifest: Manifest = serde_json::from_str(&response.body).map_err(|e| {
            KeelError::RegistryUnavailable(format!("Manifest for {} has no config digest: {}", repo, e))
        })?;
        Ok(manifest.config.digest)
    }

    async fn manifest_v2(&self, registry: &str, repo: &str, tag: &str) -> Result<RegistryResponse> {
        let repo = if repo.contains('/') {
            repo.to_string()
        } else {
            format!("library/{}", repo)
        };

        let token = self.pull_token(registry, &repo).await?;

        let url = format!("https://index.{}/v2/{}/manifests/{}", registry, repo, tag);
        let headers = [
            ("Authorization", format!("Bearer {}", token)),
            ("Accept", media_types::MANIFEST_V2.to_string()),
        ];
        let response = self.transport.get(&url, &headers).await?;

        if !response.is_success() {
            return Err(KeelError::RegistryUnavailable(format!(
                "Failed to fetch manifest {}: {}",
                url, response.status
            )));
        }
        Ok(response)
    }

    async fn pull_token(&self, registry: &str, repo: &str) -> Result<String> {
        let url = format!(
            "http://auth.{}/token?service=registry.{}&scope=repository:{}:pull",
            registry, registry, repo
        );
        let response = self
            .transport
            .get(&url, &[])
            .await
            .map_err(|e| KeelError::Auth(e.to_string()))?;

        if !response.is_success() {
            return Err(KeelError::Auth(format!("{} answered {}", url, response.status)));
        }

        let token: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|e| KeelError::Auth(format!("Invalid token response: {}", e)))?;
        token
            .token
            .ok_or_else(|| KeelError::Auth(format!("No token in response from {}", url)))
    }
}

#[async_trait]
impl<T: RegistryTransport> ImageResolver for RegistryClient<T> {
    async fn resolve_image_identifier(&self, name: &str) -> Result<String> {
        self.resolve(name).await
    }

    async fn resolve_manifest_digest(&self, name: &str) -> Result<String> {
        self.manifest_digest(name).await
    }
}
