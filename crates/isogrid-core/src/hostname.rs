//! Elastic hostnames: the DNS-stable addresses instances reach each other by.
//!
//! An instance named `api` owned by `acme` answers at
//! `api-staging-acme.{domain}`. Isolated forks are named
//! `{masterShortHash}--{name}`, so their hostnames carry the same prefix;
//! stripping it yields the canonical hostname the fork stands in for.

use std::collections::BTreeSet;

use regex::Regex;

/// Separates an isolated fork's master short hash from the forked name.
pub const ISOLATION_SEPARATOR: &str = "--";

const STAGING_INFIX: &str = "-staging-";

/// Derives and recognises elastic hostnames under one user-content domain.
#[derive(Debug, Clone)]
pub struct HostnameScheme {
    domain: String,
    pattern: Regex,
}

impl HostnameScheme {
    pub fn new(domain: &str) -> Result<Self, regex::Error> {
        let domain = domain.trim_matches('.').to_ascii_lowercase();
        let pattern = Regex::new(&format!(
            r"(?i)\b[a-z0-9][a-z0-9.-]*\.{}\b",
            regex::escape(&domain)
        ))?;
        Ok(Self { domain, pattern })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Hostname for an instance name under an owner.
    pub fn elastic_hostname(&self, name: &str, owner_username: &str) -> String {
        format!(
            "{}{}{}.{}",
            name.to_ascii_lowercase(),
            STAGING_INFIX,
            owner_username.to_ascii_lowercase(),
            self.domain
        )
    }

    /// Every distinct hostname under this domain mentioned in `text`, lowercased.
    pub fn extract(&self, text: &str) -> BTreeSet<String> {
        self.pattern
            .find_iter(text)
            .map(|m| m.as_str().to_ascii_lowercase())
            .collect()
    }

    /// [`extract`](Self::extract) over many strings (env lines, replace rules).
    pub fn extract_all<'a, I>(&self, texts: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        texts
            .into_iter()
            .flat_map(|text| self.extract(text))
            .collect()
    }
}

/// Name given to a fork created inside an isolation group.
pub fn isolated_name(master_short_hash: &str, name: &str) -> String {
    format!("{master_short_hash}{ISOLATION_SEPARATOR}{name}")
}

/// Name of an isolated fork with its `{masterShortHash}--` prefix removed.
///
/// Only meaningful for names known to belong to a fork: a plain instance may
/// legitimately be called `billing--worker`, and must not be cut.
pub fn canonical_name(name: &str) -> &str {
    match name.split_once(ISOLATION_SEPARATOR) {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => name,
    }
}

/// Hostname of an isolated fork with its prefix removed, lowercased.
pub fn canonical_hostname(hostname: &str) -> String {
    canonical_name(hostname).to_ascii_lowercase()
}
