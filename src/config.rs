//! Node configuration
//!
//! Loaded from a JSON file. Every field has a default, so a partial file
//! (or none at all, via `NodeConfig::default()`) is enough to run a node.

use crate::network::peer::{EvictionPolicy, MAX_PEERS};
use crate::transfer::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// P2P node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host to listen on and advertise to peers
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Peers to dial at startup
    pub seed_nodes: Vec<String>,
    /// Upper bound on registry size
    pub max_peers: usize,
    /// Seconds between ping sweeps
    pub ping_interval: u64,
    /// Seconds between seed reconnection attempts
    pub discovery_interval: u64,
    /// Directory for transferred files and their metadata
    pub data_dir: PathBuf,
    /// Chunk size for files registered by this node
    pub chunk_size: u32,
    /// Concurrent outbound message sends
    pub max_concurrent_sends: usize,
    /// Concurrent outbound file transfers
    pub max_concurrent_transfers: usize,
    /// Policy for a full peer registry
    pub eviction: EvictionPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            seed_nodes: Vec::new(),
            max_peers: MAX_PEERS,
            ping_interval: 30,
            discovery_interval: 30,
            data_dir: PathBuf::from("data"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_sends: 16,
            max_concurrent_transfers: 4,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let config: NodeConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.max_peers == 0, "max_peers must be positive"),
            (self.ping_interval == 0, "ping_interval must be positive"),
            (self.discovery_interval == 0, "discovery_interval must be positive"),
            (self.chunk_size == 0, "chunk_size must be positive"),
            (
                self.chunk_size > MAX_CHUNK_SIZE,
                "chunk_size is too large to fit in one frame",
            ),
            (self.max_concurrent_sends == 0, "max_concurrent_sends must be positive"),
            (
                self.max_concurrent_transfers == 0,
                "max_concurrent_transfers must be positive",
            ),
            (self.host.is_empty(), "host must not be empty"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::Invalid(reason.to_string())),
            None => Ok(()),
        }
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"port": 9001, "seed_nodes": ["127.0.0.1:9002"], "max_peers": 5, "ping_interval": 10, "data_dir": "files"}"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.seed_nodes, vec!["127.0.0.1:9002"]);
        assert_eq!(config.max_peers, 5);
        assert_eq!(config.ping_interval(), Duration::from_secs(10));
        assert_eq!(config.data_dir, PathBuf::from("files"));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.eviction, EvictionPolicy::RejectNew);
        assert_eq!(config.listen_addr(), "127.0.0.1:9001");
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.json");

        let config = NodeConfig {
            eviction: EvictionPolicy::EvictLeastRecentlySeen,
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_chunk_size_limit() {
        let largest = NodeConfig {
            chunk_size: MAX_CHUNK_SIZE,
            ..Default::default()
        };
        assert!(largest.validate().is_ok());

        for chunk_size in [MAX_CHUNK_SIZE + 1, 8 * 1024 * 1024] {
            let config = NodeConfig {
                chunk_size,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_invalid_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        fs::write(&path, r#"{"max_peers": 0}"#).unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, format!(r#"{{"chunk_size": {}}}"#, MAX_CHUNK_SIZE + 1)).unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, r#"{"port": "not a number"}"#).unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::SerializationError(_))
        ));

        assert!(matches!(
            NodeConfig::load(&temp_dir.path().join("missing.json")),
            Err(ConfigError::IoError(_))
        ));
    }
}
