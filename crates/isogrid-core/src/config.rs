//! isogrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::hostname::HostnameScheme;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid hostname domain: {0}")]
    Hostname(#[from] regex::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IsoGridConfig {
    pub hostnames: HostnameConfig,
    pub store: StoreConfig,
    pub source_control: SourceControlConfig,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostnameConfig {
    /// User-content domain every elastic hostname ends with.
    pub domain: String,
}

impl Default for HostnameConfig {
    fn default() -> Self {
        Self {
            domain: "isogrid.local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/isogrid/isogrid.redb"),
        }
    }
}

/// Pinned branch heads for the standalone source-control client.
///
/// Keys are `"org/repo#branch"`, values are commit shas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceControlConfig {
    pub branches: HashMap<String, String>,
}

/// A locally known user, resolvable by GitHub id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConfig {
    pub github_id: u64,
    pub username: String,
    #[serde(default)]
    pub org_ids: Vec<u64>,
}

impl IsoGridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build the hostname scheme for the configured domain.
    pub fn hostname_scheme(&self) -> Result<HostnameScheme, ConfigError> {
        Ok(HostnameScheme::new(&self.hostnames.domain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = IsoGridConfig::from_toml_str("").unwrap();
        assert_eq!(config.hostnames.domain, "isogrid.local");
        assert_eq!(
            config.store.path,
            PathBuf::from("/var/lib/isogrid/isogrid.redb")
        );
        assert!(config.source_control.branches.is_empty());
        assert!(config.users.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[hostnames]
domain = "runnable.test"

[store]
path = "/tmp/iso.redb"

[source_control.branches]
"acme/api#master" = "abc123"

[[users]]
github_id = 42
username = "octo"
org_ids = [7]
"#;
        let config = IsoGridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.hostnames.domain, "runnable.test");
        assert_eq!(config.store.path, PathBuf::from("/tmp/iso.redb"));
        assert_eq!(
            config.source_control.branches.get("acme/api#master"),
            Some(&"abc123".to_string())
        );
        assert_eq!(config.users[0].org_ids, vec![7]);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("isogrid.toml");
        std::fs::write(&path, "[hostnames]\ndomain = \"example.dev\"\n").unwrap();

        let config = IsoGridConfig::from_file(&path).unwrap();
        assert_eq!(config.hostnames.domain, "example.dev");
    }

    #[test]
    fn serialized_config_parses_back() {
        let mut config = IsoGridConfig::default();
        config
            .source_control
            .branches
            .insert("acme/web#main".to_string(), "def456".to_string());
        let text = config.to_toml_string().unwrap();
        assert_eq!(IsoGridConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn malformed_config_is_parse_error() {
        let err = IsoGridConfig::from_toml_str("[hostnames\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
