//! Server configuration
//!
//! Loaded from an optional JSON file; command-line flags override file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::instance::InstanceOptions;
use crate::matcher::MatchMode;
use crate::wire::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unix socket the server listens on
    pub socket_path: PathBuf,
    /// Hosts created at startup (one per shard or replica member)
    pub hosts: Vec<String>,
    pub match_mode: MatchMode,
    pub order_check: bool,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/search-mock.sock"),
            hosts: Vec::new(),
            match_mode: MatchMode::Subset,
            order_check: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn instance_options(&self) -> InstanceOptions {
        InstanceOptions {
            match_mode: self.match_mode,
            order_check: self.order_check,
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.match_mode, MatchMode::Subset);
        assert!(config.order_check);
        assert!(config.hosts.is_empty());
        assert_eq!(config.instance_options(), InstanceOptions::default());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mock.json");
        std::fs::write(&path, r#"{"hosts": ["shard0", "shard1"], "matchMode": "exact"}"#).unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.hosts, vec!["shard0", "shard1"]);
        assert_eq!(config.match_mode, MatchMode::Exact);
        assert!(config.order_check);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = ServerConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
