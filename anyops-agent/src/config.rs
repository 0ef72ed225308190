use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Agent configuration, written next to the binary by the deployer.
/// Values in the file take precedence over command-line flags so a
/// redeployed agent keeps pointing at the right management server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub mgmt_host: String,
    #[serde(default)]
    pub mgmt_port: u16,
    #[serde(default)]
    pub node_ip: String,
    #[serde(default)]
    pub deployment_time: String,
    #[serde(default)]
    pub control_port: u16,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: AgentConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Server URL the heartbeat is posted to, or `None` when the file
    /// carries no management address.
    pub fn server_url(&self) -> Option<String> {
        if self.mgmt_host.is_empty() || self.mgmt_port == 0 {
            return None;
        }
        Some(format!("http://{}:{}", self.mgmt_host, self.mgmt_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_file_fills_defaults() {
        let cfg: AgentConfig =
            serde_json::from_str(r#"{"mgmt_host":"172.20.0.1","mgmt_port":8080}"#).unwrap();
        assert_eq!(cfg.server_url().unwrap(), "http://172.20.0.1:8080");
        assert!(cfg.node_ip.is_empty());
        assert_eq!(cfg.control_port, 0);
    }

    #[test]
    fn empty_host_yields_no_server_url() {
        let cfg = AgentConfig::default();
        assert!(cfg.server_url().is_none());
    }
}
