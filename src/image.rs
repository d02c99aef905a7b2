//! Canonical container image references.
//!
//! A service spec's image must parse as a canonical reference of the form
//! `[registry/]repository[:tag][@digest]`. The parsed form is also used to
//! derive a default service name from the image basename.

use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// A parsed container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, for example `ghcr.io` or `localhost:5000`. `None`
    /// means the runtime's default registry.
    pub registry: Option<String>,
    /// Repository path, for example `library/nginx`.
    pub repository: String,
    /// Tag, for example `1.27-alpine`.
    pub tag: Option<String>,
    /// Content digest, for example `sha256:4f67…`.
    pub digest: Option<String>,
}

impl ImageReference {
    /// The final path segment of the repository, used when generating a
    /// service name from an image.
    pub fn base_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

/// A path component is a registry host rather than part of the repository
/// when it contains a dot or a port, or is the literal `localhost`.
fn is_registry_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::invalid_spec("image reference must not be empty"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(Error::invalid_spec(format!(
                "invalid image reference: '{s}'"
            )));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((head, tail)) => {
                if !tail.contains(':') {
                    return Err(Error::invalid_spec(format!(
                        "invalid image digest: '{tail}'"
                    )));
                }
                (head, Some(tail.to_owned()))
            }
            None => (s, None),
        };

        // The last colon separates the tag only if it comes after the last
        // path separator, otherwise it belongs to a registry port.
        let (rest, tag) = match rest.rsplit_once(':') {
            Some((head, tail)) if !tail.contains('/') => (head, Some(tail.to_owned())),
            _ => (rest, None),
        };

        let (registry, repository) = match rest.split_once('/') {
            Some((first, remainder)) if is_registry_host(first) => {
                (Some(first.to_owned()), remainder.to_owned())
            }
            _ => (None, rest.to_owned()),
        };

        if repository.is_empty() {
            return Err(Error::invalid_spec(format!(
                "invalid image reference: '{s}'"
            )));
        }
        if let Some(tag) = &tag {
            if tag.is_empty() {
                return Err(Error::invalid_spec(format!(
                    "image tag must not be empty: '{s}'"
                )));
            }
        }

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
