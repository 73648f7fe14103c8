// config.rs - Node and Trust Configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `PEER_TRUST__TRUST__MAX_DEGREE=2`
pub const ENV_PREFIX: &str = "PEER_TRUST";

/// Tunables of the trust computation and protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Maximum certification distance from the owner
    pub max_degree: i32,

    /// Certificates from known subjects needed to become known
    pub known_required: usize,

    /// Seconds before an unfinished handshake is discarded
    pub handshake_timeout_secs: u64,

    /// Aliases returned in meta information
    pub max_meta_aliases: usize,

    /// Sub-keys the owner may hold per application package
    pub max_subkeys_per_app: usize,

    /// Verify signatures when loading from the repository
    pub strict_integrity: bool,

    /// Repository directory, relative to the data directory
    pub trust_dir: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            max_degree: 3,
            known_required: 3,
            handshake_timeout_secs: 300,
            max_meta_aliases: 5,
            max_subkeys_per_app: 5,
            strict_integrity: true,
            trust_dir: "trust".into(),
        }
    }
}

impl TrustConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Logging options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, overridden by `RUST_LOG`
    pub filter: String,

    /// pretty, compact or json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,peer_trust=debug".into(),
            format: "pretty".into(),
        }
    }
}

/// Top-level node configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub trust: TrustConfig,
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            trust: TrustConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Layer defaults, an optional TOML file and `PEER_TRUST__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Directory holding the certificate repository
    pub fn trust_path(&self) -> PathBuf {
        self.data_dir.join(&self.trust.trust_dir)
    }

    /// File holding the exported master key
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TrustConfig::default();
        assert_eq!(config.max_degree, 3);
        assert_eq!(config.known_required, 3);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_meta_aliases, 5);
        assert_eq!(config.max_subkeys_per_app, 5);
        assert!(config.strict_integrity);
    }

    #[test]
    fn test_paths() {
        let config = NodeConfig {
            data_dir: PathBuf::from("/var/lib/peer-trust"),
            ..NodeConfig::default()
        };
        assert_eq!(config.trust_path(), PathBuf::from("/var/lib/peer-trust/trust"));
        assert_eq!(config.key_path(), PathBuf::from("/var/lib/peer-trust/identity.key"));
    }

    #[test]
    fn test_load_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/srv/node"

[trust]
max_degree = 2
strict_integrity = false

[log]
format = "json"
"#,
        )
        .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/node"));
        assert_eq!(config.trust.max_degree, 2);
        assert!(!config.trust.strict_integrity);
        assert_eq!(config.trust.known_required, 3);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(NodeConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
