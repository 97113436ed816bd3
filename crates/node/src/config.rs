//! Node Configuration

use anyhow::{bail, Context, Result};
use oracle_consensus::{Epoch, NodeIndex, ProtocolParams, Value};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Network-wide configuration shared by every node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Epoch to run
    pub epoch: Epoch,
    /// Index of the epoch's leader
    pub leader: NodeIndex,
    /// WebSocket address of every node, by index
    pub peers: Vec<String>,
    /// Protocol parameters
    pub params: ProtocolParams,
    /// Value source: random walk starting here
    pub initial_value: Value,
    /// Largest change per round of the random walk (0 = fixed value)
    pub max_step: Value,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::local(5, 9000)
    }
}

impl NodeConfig {
    /// Config for `num_nodes` on localhost, ports counting up from `base_port`
    pub fn local(num_nodes: usize, base_port: u16) -> Self {
        Self {
            epoch: 0,
            leader: 0,
            peers: (0..num_nodes)
                .map(|i| format!("127.0.0.1:{}", base_port as usize + i))
                .collect(),
            params: ProtocolParams::for_network(num_nodes),
            initial_value: 100_000,
            max_step: 50,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {:?}", path.as_ref()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing config {:?}", path.as_ref()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        if self.peers.len() != self.params.num_nodes {
            bail!(
                "{} peer addresses for a network of {}",
                self.peers.len(),
                self.params.num_nodes
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_is_valid() {
        let config = NodeConfig::local(4, 7000);
        assert_eq!(config.peers[3], "127.0.0.1:7003");
        assert_eq!(config.params.faults, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oracle.json");
        let mut config = NodeConfig::local(7, 9100);
        config.leader = 3;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.leader, 3);
        assert_eq!(loaded.params, config.params);
    }

    #[test]
    fn test_params_sized_from_num_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oracle.json");
        let peers: Vec<String> = (0..7).map(|i| format!("127.0.0.1:{}", 9200 + i)).collect();
        let json = serde_json::json!({ "peers": peers, "params": { "num_nodes": 7 } });
        std::fs::write(&path, json.to_string()).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.params, ProtocolParams::for_network(7));
        assert_eq!(loaded.params.faults, 2);
        assert_eq!(loaded.params.echo_threshold, 5);
    }

    #[test]
    fn test_peer_count_must_match() {
        let mut config = NodeConfig::local(4, 7000);
        config.peers.pop();
        assert!(config.validate().is_err());
    }
}
