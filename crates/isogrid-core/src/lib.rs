pub mod config;
pub mod hostname;

pub use config::{ConfigError, IsoGridConfig, UserConfig};
pub use hostname::{HostnameScheme, canonical_hostname, canonical_name, isolated_name};
