//! Host allow-list for `host.fetchText`.

use std::net::IpAddr;

use hashbrown::HashSet;
use url::Url;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetworkAcl {
    allow_all: bool,
    exact_hosts: HashSet<String>,
    /// Suffixes including their leading `.`.
    suffix_wildcards: Vec<String>,
}

impl NetworkAcl {
    /// Builds an ACL from `*`, exact host and `*.suffix` patterns. No patterns allows every host.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut acl = Self {
            allow_all: patterns.is_empty(),
            ..Self::default()
        };
        for pattern in patterns {
            acl.add_host(pattern.as_ref());
        }
        acl
    }

    fn add_host(&mut self, raw: &str) {
        let host = normalize_host(raw);
        if host.is_empty() {
            return;
        }
        if host == "*" {
            self.allow_all = true;
            return;
        }
        if let Some(suffix) = host.strip_prefix("*.") {
            self.suffix_wildcards.push(format!(".{suffix}"));
            return;
        }
        self.exact_hosts.insert(host);
    }

    pub fn allows(&self, host: &str) -> bool {
        if self.allow_all {
            return true;
        }

        let normalized = normalize_host(host);
        if normalized.is_empty() {
            return false;
        }

        self.exact_hosts.contains(&normalized)
            || self
                .suffix_wildcards
                .iter()
                .any(|suffix| normalized.ends_with(suffix.as_str()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum UrlError {
    #[error("invalid URL {url:?}: {reason}")]
    Invalid { url: String, reason: String },
    #[error("only http and https URLs may be fetched, got {0:?}")]
    UnsupportedScheme(String),
    #[error("URL {0:?} has no host")]
    MissingHost(String),
}

/// Parses an `http` or `https` URL, returning it with its normalised host. The returned [Url] is
/// the one to request, so the host checked against the ACL is the host connected to.
pub fn parse_fetch_url(raw: &str) -> Result<(Url, String), UrlError> {
    let url = Url::parse(raw).map_err(|err| UrlError::Invalid {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlError::UnsupportedScheme(raw.to_string()));
    }

    let host = url.host_str().map(normalize_host).unwrap_or_default();
    if host.is_empty() {
        return Err(UrlError::MissingHost(raw.to_string()));
    }
    Ok((url, host))
}

fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    // Bracketed IPv6 literals, with or without a port.
    if let Some(stripped) = trimmed.strip_prefix('[') {
        if let Some((inside, _)) = stripped.split_once(']') {
            return inside.trim().to_ascii_lowercase();
        }
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return ip.to_string().to_ascii_lowercase();
    }

    // A single colon separates a port. More colons are an unbracketed IPv6 literal.
    if trimmed.matches(':').count() == 1 {
        if let Some((left, right)) = trimmed.rsplit_once(':') {
            if right.chars().all(|c| c.is_ascii_digit()) {
                return left.trim().to_ascii_lowercase();
            }
        }
    }

    trimmed.to_ascii_lowercase()
}
