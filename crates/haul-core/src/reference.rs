//! Container image references.
//!
//! Accepted forms are `name`, `name:tag`, `repo/name:tag` and deeper
//! `org/team/name:tag` paths. The repository defaults to `library` and the
//! tag to `latest`, matching how public registries resolve short names.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::HaulError;

/// Repository used when the reference has no path component.
pub const DEFAULT_REPOSITORY: &str = "library";
/// Tag used when the reference has none.
pub const DEFAULT_TAG: &str = "latest";

const MAX_COMPONENT_LEN: usize = 128;

static COMPONENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").expect("static regex"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("static regex"));

/// Immutable, validated reference to a remote image.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactReference {
    repository: String,
    name: String,
    tag: String,
}

impl ArtifactReference {
    /// Parse and validate a reference string.
    pub fn parse(input: &str) -> Result<Self, HaulError> {
        let invalid = |reason: &str| HaulError::InvalidReference {
            input: input.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let last_slash = trimmed.rfind('/');
        let (path, tag) = match trimmed.rfind(':') {
            Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
                (&trimmed[..colon], &trimmed[colon + 1..])
            }
            _ => (trimmed, DEFAULT_TAG),
        };

        if tag.is_empty() {
            return Err(invalid("tag is empty"));
        }
        if tag.len() > MAX_COMPONENT_LEN || !TAG_RE.is_match(tag) {
            return Err(invalid("tag may only contain letters, digits, '_', '.' and '-'"));
        }

        let mut segments: Vec<&str> = path.split('/').collect();
        for segment in &segments {
            if segment.is_empty() {
                return Err(invalid("empty path component"));
            }
            if segment.len() > MAX_COMPONENT_LEN || !COMPONENT_RE.is_match(segment) {
                return Err(invalid(
                    "path components must be lowercase letters, digits and single separators",
                ));
            }
        }

        let name = segments.pop().unwrap_or_default().to_owned();
        let repository = if segments.is_empty() {
            DEFAULT_REPOSITORY.to_owned()
        } else {
            segments.join("/")
        };

        Ok(Self {
            repository,
            name,
            tag: tag.to_owned(),
        })
    }

    /// Repository path, e.g. `library`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Image name, e.g. `alpine`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image tag, e.g. `latest`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `repository/name`, the path a registry addresses manifests under.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.repository, self.name)
    }

    /// File name of the delivered archive, e.g. `alpine-latest.tar`.
    pub fn archive_name(&self) -> String {
        if self.repository == DEFAULT_REPOSITORY {
            format!("{}-{}.tar", self.name, self.tag)
        } else {
            format!(
                "{}-{}-{}.tar",
                self.repository.replace('/', "-"),
                self.name,
                self.tag
            )
        }
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.tag)
    }
}

impl FromStr for ArtifactReference {
    type Err = HaulError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ArtifactReference {
    type Error = HaulError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactReference> for String {
    fn from(reference: ArtifactReference) -> Self {
        reference.to_string()
    }
}
