//! Configuration files and command-line overrides.

use std::path::{Path, PathBuf};
use udup_cluster::AgentConfig;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML file did not parse
    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        /// File path
        path: PathBuf,
        /// Parser error
        #[source]
        source: toml::de::Error,
    },

    /// JSON file did not parse
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        /// File path
        path: PathBuf,
        /// Parser error
        #[source]
        source: serde_json::Error,
    },
}

/// Load an agent configuration file.
///
/// `.toml` and `.json` files are parsed by extension; any other file is
/// tried as TOML first, then as JSON. Missing fields keep their defaults.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let toml_err = |source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    };
    let json_err = |source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    };

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&text).map_err(toml_err),
        Some("json") => serde_json::from_str(&text).map_err(json_err),
        _ => match toml::from_str(&text) {
            Ok(config) => Ok(config),
            Err(_) => serde_json::from_str(&text).map_err(json_err),
        },
    }
}

/// Values given on the command line, applied over the file configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Node name
    pub node: Option<String>,
    /// Gossip bind address
    pub bind: Option<String>,
    /// Interface to bind gossip to
    pub iface: Option<String>,
    /// Force server mode
    pub server: bool,
    /// Extra peers to join
    pub join: Vec<String>,
    /// RPC port
    pub rpc_port: Option<u16>,
    /// HTTP surface address
    pub http_addr: Option<String>,
}

impl Overrides {
    /// Apply to `config`
    pub fn apply(self, config: &mut AgentConfig) {
        if let Some(node) = self.node {
            config.node_name = node;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if self.iface.is_some() {
            config.interface = self.iface;
        }
        if self.server {
            config.server = true;
        }
        config.start_join.extend(self.join);
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
    }
}
