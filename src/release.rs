//! Release resolution.
//!
//! Turns a [`ReleaseMode`] into a concrete vendor release: tag, payload URL
//! and the filenames derived from the tag. Resolution only talks to the
//! metadata API; nothing on disk is touched until it succeeds.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ReleaseMode;
use crate::error::BuildError;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("emcomm-iso/", env!("CARGO_PKG_VERSION"));

/// ISO 9660 volume identifiers are limited to 32 characters.
const MAX_VOLUME_LABEL: usize = 32;

/// A published release as reported by the metadata API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseRecord {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    pub tarball_url: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

/// A bare git tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TagRecord {
    pub name: String,
    pub tarball_url: String,
}

/// Where release metadata comes from.
pub trait ReleaseSource {
    /// Most recent formally published release, if any.
    fn latest_release(&self) -> Result<Option<ReleaseRecord>>;
    /// The release attached to `tag`, if one was published.
    fn release_for_tag(&self, tag: &str) -> Result<Option<ReleaseRecord>>;
    /// All tags, in whatever order the source lists them.
    fn tags(&self) -> Result<Vec<TagRecord>>;
}

/// GitHub REST API source.
pub struct GitHubSource {
    client: reqwest::blocking::Client,
    api_base: String,
    repo: String,
    token: Option<String>,
}

impl GitHubSource {
    pub fn new(repo: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_base: GITHUB_API.to_string(),
            repo: repo.to_string(),
            token,
        })
    }

    /// GET a JSON document. 404 maps to `None`.
    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}/repos/{}/{}", self.api_base, self.repo, path);
        debug!(%url, "release metadata request");

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| BuildError::Network(format!("{}: {}", url, e)))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BuildError::Network(format!(
                "HTTP {} for {}: {}",
                status.as_u16(),
                url,
                status.canonical_reason().unwrap_or("Unknown error")
            ))
            .into());
        }

        let body = response
            .text()
            .map_err(|e| BuildError::Network(format!("{}: {}", url, e)))?;
        let parsed = serde_json::from_str(&body)
            .with_context(|| format!("Unexpected response from {}", url))?;
        Ok(Some(parsed))
    }
}

impl ReleaseSource for GitHubSource {
    fn latest_release(&self) -> Result<Option<ReleaseRecord>> {
        self.get_json("releases/latest")
    }

    fn release_for_tag(&self, tag: &str) -> Result<Option<ReleaseRecord>> {
        self.get_json(&format!("releases/tags/{}", tag))
    }

    fn tags(&self) -> Result<Vec<TagRecord>> {
        Ok(self.get_json("tags?per_page=100")?.unwrap_or_default())
    }
}

/// The release a build is pinned to, with its derived filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub tag: String,
    pub name: String,
    /// Absent when resolved from a bare tag.
    pub published_at: Option<String>,
    pub payload_url: String,
}

impl ResolvedRelease {
    fn from_release(r: ReleaseRecord) -> Self {
        Self {
            name: r.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| r.tag_name.clone()),
            tag: r.tag_name,
            published_at: r.published_at,
            payload_url: r.tarball_url,
        }
    }

    fn from_tag(t: TagRecord, published_at: Option<String>) -> Self {
        Self {
            name: t.name.clone(),
            tag: t.name,
            published_at,
            payload_url: t.tarball_url,
        }
    }

    /// Cache filename of the vendor payload.
    pub fn payload_filename(&self) -> String {
        format!("emcomm-tools-{}.tar.gz", sanitize(&self.tag))
    }

    /// Filename of the finished image.
    pub fn image_filename(&self) -> String {
        format!("{}-custom.iso", sanitize(&self.tag))
    }

    /// ISO volume label, uppercase and at most 32 characters.
    pub fn volume_label(&self) -> String {
        let mut label = format!("ETC_{}", sanitize(&self.tag).to_uppercase().replace(['-', '.'], "_"));
        label.truncate(MAX_VOLUME_LABEL);
        label
    }

    /// Single-line description stamped into the image.
    pub fn describe(&self) -> String {
        match &self.published_at {
            Some(date) => format!("EmComm Tools {} ({}, published {})", self.tag, self.name, date),
            None => format!("EmComm Tools {} ({})", self.tag, self.name),
        }
    }
}

/// Keep tags usable as filename components.
fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') { c } else { '_' })
        .collect()
}

/// Compare tag names with runs of digits compared as numbers, so `R10`
/// sorts after `R9` and embedded `YYYYMMDD` stamps sort by date.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a.as_bytes(), b.as_bytes());
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (na, rest_a) = a.split_at(digit_run(a));
                let (nb, rest_b) = b.split_at(digit_run(b));
                let (na, nb) = (trim_zeros(na), trim_zeros(nb));
                let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = rest_a;
                b = rest_b;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn digit_run(s: &[u8]) -> usize {
    s.iter().take_while(|c| c.is_ascii_digit()).count()
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let zeros = digits.iter().take_while(|&&c| c == b'0').count();
    &digits[zeros..]
}

/// Resolve `mode` against `source`.
///
/// A missing release surfaces as [`BuildError::ReleaseNotFound`]; transport
/// problems as [`BuildError::Network`].
pub fn resolve(source: &dyn ReleaseSource, mode: &ReleaseMode) -> Result<ResolvedRelease> {
    let resolved = match mode {
        ReleaseMode::Stable => {
            let release = source
                .latest_release()?
                .ok_or_else(|| BuildError::ReleaseNotFound("no published release".into()))?;
            ResolvedRelease::from_release(release)
        }
        ReleaseMode::Latest => {
            // GitHub lists tags by name, not by age.
            let tag = source
                .tags()?
                .into_iter()
                .max_by(|a, b| natural_cmp(&a.name, &b.name))
                .ok_or_else(|| BuildError::ReleaseNotFound("repository has no tags".into()))?;
            let published_at = source
                .release_for_tag(&tag.name)?
                .and_then(|r| r.published_at);
            ResolvedRelease::from_tag(tag, published_at)
        }
        ReleaseMode::Tag(tag) => match source.release_for_tag(tag)? {
            Some(release) => ResolvedRelease::from_release(release),
            None => {
                let bare = source
                    .tags()?
                    .into_iter()
                    .find(|t| t.name == *tag)
                    .ok_or_else(|| BuildError::ReleaseNotFound(tag.clone()))?;
                ResolvedRelease::from_tag(bare, None)
            }
        },
    };

    info!(
        mode = %mode,
        tag = %resolved.tag,
        published = resolved.published_at.as_deref().unwrap_or("unpublished"),
        "release resolved"
    );
    Ok(resolved)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    /// In-memory release metadata.
    #[derive(Debug, Default, Clone)]
    pub struct StaticSource {
        pub releases: Vec<ReleaseRecord>,
        pub tags: Vec<TagRecord>,
    }

    impl StaticSource {
        pub fn release(tag: &str, date: &str) -> ReleaseRecord {
            ReleaseRecord {
                tag_name: tag.into(),
                name: Some(format!("Release {}", tag)),
                published_at: Some(date.into()),
                tarball_url: format!("https://example.invalid/tarball/{}", tag),
                draft: false,
                prerelease: false,
            }
        }

        pub fn tag(name: &str) -> TagRecord {
            TagRecord {
                name: name.into(),
                tarball_url: format!("https://example.invalid/tarball/{}", name),
            }
        }
    }

    impl ReleaseSource for StaticSource {
        fn latest_release(&self) -> Result<Option<ReleaseRecord>> {
            Ok(self.releases.iter().find(|r| !r.draft && !r.prerelease).cloned())
        }

        fn release_for_tag(&self, tag: &str) -> Result<Option<ReleaseRecord>> {
            Ok(self.releases.iter().find(|r| r.tag_name == tag).cloned())
        }

        fn tags(&self) -> Result<Vec<TagRecord>> {
            Ok(self.tags.clone())
        }
    }
}
