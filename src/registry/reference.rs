//! Image reference parsing

use crate::error::{KeelError, Result};

/// Default index host
pub const INDEX_NAME: &str = "docker.io";

/// Tag used when a reference names none
pub const DEFAULT_TAG: &str = "latest";

/// How the tag part was attached to the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `repo:tag`
    Tag,
    /// `repo@digest`
    Digest,
}

impl Separator {
    pub fn as_char(self) -> char {
        match self {
            Separator::Tag => ':',
            Separator::Digest => '@',
        }
    }
}

/// A symbolic image name split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub repository: String,
    tag: String,
    pub separator: Separator,
}

impl ImageReference {
    /// Split `name` into repository, tag and separator
    ///
    /// A digest (`@`) wins over a tag. A `:` followed by a `/` belongs to a
    /// registry port, not a tag.
    pub fn parse(name: &str) -> Self {
        if let Some((repository, digest)) = name.rsplit_once('@') {
            return Self {
                repository: repository.to_string(),
                tag: digest.to_string(),
                separator: Separator::Digest,
            };
        }

        let (repository, tag) = match name.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (name, ""),
        };

        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            separator: Separator::Tag,
        }
    }

    /// Tag or digest, `latest` when the name had none
    pub fn tag(&self) -> &str {
        if self.tag.is_empty() {
            DEFAULT_TAG
        } else {
            &self.tag
        }
    }

    /// Registry host and repository path
    pub fn resolve(&self) -> Result<(String, String)> {
        resolve_repository_name(&self.repository)
    }
}

/// Split a repository into its registry host and remote name
pub fn resolve_repository_name(repository: &str) -> Result<(String, String)> {
    if repository.contains("://") {
        return Err(KeelError::InvalidReference(format!(
            "Repository name cannot contain a scheme: {}",
            repository
        )));
    }

    let (index, remote) = split_repo_name(repository);
    if index.starts_with('-') || index.ends_with('-') {
        return Err(KeelError::InvalidReference(format!(
            "Invalid index name ({}). Cannot begin or end with a hyphen.",
            index
        )));
    }

    Ok((resolve_index_name(index), remote.to_string()))
}

fn split_repo_name(repository: &str) -> (&str, &str) {
    match repository.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (first, rest)
        }
        _ => (INDEX_NAME, repository),
    }
}

fn resolve_index_name(index: &str) -> String {
    if index == format!("index.{}", INDEX_NAME) {
        INDEX_NAME.to_string()
    } else {
        index.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name() {
        let r = ImageReference::parse("nginx");
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag(), "latest");
        assert_eq!(r.separator, Separator::Tag);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let tagged = ImageReference::parse("redis:7-alpine");
        assert_eq!(tagged.repository, "redis");
        assert_eq!(tagged.tag(), "7-alpine");

        let pinned = ImageReference::parse("nginx@sha256:abc");
        assert_eq!(pinned.repository, "nginx");
        assert_eq!(pinned.tag(), "sha256:abc");
        assert_eq!(pinned.separator.as_char(), '@');
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let r = ImageReference::parse("localhost:5000/team/app");
        assert_eq!(r.repository, "localhost:5000/team/app");
        assert_eq!(r.tag(), "latest");

        let tagged = ImageReference::parse("localhost:5000/team/app:v2");
        assert_eq!(tagged.repository, "localhost:5000/team/app");
        assert_eq!(tagged.tag(), "v2");
    }

    #[test]
    fn test_resolve_repository_name() {
        assert_eq!(
            resolve_repository_name("nginx").unwrap(),
            ("docker.io".to_string(), "nginx".to_string())
        );
        assert_eq!(
            resolve_repository_name("nodered/node-red").unwrap(),
            ("docker.io".to_string(), "nodered/node-red".to_string())
        );
        assert_eq!(
            resolve_repository_name("index.docker.io/library/nginx").unwrap(),
            ("docker.io".to_string(), "library/nginx".to_string())
        );
        assert_eq!(
            resolve_repository_name("quay.io/coreos/etcd").unwrap(),
            ("quay.io".to_string(), "coreos/etcd".to_string())
        );
    }

    #[test]
    fn test_invalid_repository_names() {
        assert!(resolve_repository_name("https://quay.io/x").is_err());
        assert!(resolve_repository_name("-bad.io/x").is_err());
    }
}
