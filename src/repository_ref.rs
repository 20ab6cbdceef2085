//! Repository identity.
//!
//! A [`RepositoryRef`] pairs the canonical upstream uri (the unique key of every
//! state row and job) with a derived local identifier that is safe to use as a
//! directory name.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::error::InvalidRepositoryUri;

const SUPPORTED_SCHEMES: &[&str] = &["https", "http", "ssh", "git", "file"];

/// Identifies an upstream repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    uri: String,
    local_id: String,
}

impl RepositoryRef {
    /// Canonicalize `uri` and derive its local identifier.
    pub fn parse(uri: &str) -> Result<Self, InvalidRepositoryUri> {
        let canonical = uri.trim().trim_end_matches('/').to_string();
        if canonical.is_empty() {
            return Err(invalid(uri, "uri is empty"));
        }

        let (host, path) = split_locator(&canonical).map_err(|reason| invalid(uri, reason))?;
        let local_id = derive_local_id(&canonical, &host, &path);

        Ok(Self {
            uri: canonical,
            local_id,
        })
    }

    /// Rebuild a reference from values that were already canonicalized, e.g. a
    /// stored row.
    pub fn from_parts(uri: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            local_id: local_id.into(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

fn invalid(uri: &str, reason: &str) -> InvalidRepositoryUri {
    InvalidRepositoryUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    }
}

/// Split a locator into host and path, accepting scheme urls and scp-like
/// `user@host:path` forms.
fn split_locator(canonical: &str) -> Result<(String, String), &'static str> {
    if canonical.contains("://") {
        let url = Url::parse(canonical).map_err(|_| "not a valid url")?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err("unsupported scheme");
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ if url.scheme() == "file" => "local".to_string(),
            _ => return Err("missing host"),
        };

        let path = url.path().trim_matches('/').to_string();
        if path.is_empty() {
            return Err("missing repository path");
        }

        return Ok((host, path));
    }

    // scp-like syntax: [user@]host:path, where the host part has no slash
    let Some((authority, path)) = canonical.split_once(':') else {
        return Err("expected a url or user@host:path");
    };
    if authority.contains('/') {
        return Err("expected a url or user@host:path");
    }

    let host = authority.rsplit('@').next().unwrap_or(authority);
    if host.is_empty() {
        return Err("missing host");
    }

    let path = path.trim_matches('/');
    if path.is_empty() {
        return Err("missing repository path");
    }

    Ok((host.to_string(), path.to_string()))
}

fn derive_local_id(canonical: &str, host: &str, path: &str) -> String {
    let mut segments: Vec<&str> = vec![host];
    segments.extend(path.split('/').filter(|segment| !segment.is_empty()));

    if let Some(last) = segments.last_mut() {
        let name: &str = *last;
        *last = name.strip_suffix(".git").unwrap_or(name);
    }

    let readable: String = segments
        .join("_")
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    let digest = Sha256::digest(canonical.as_bytes());
    let suffix = hex::encode(&digest[..4]);

    format!("{}-{}", readable, suffix)
}
