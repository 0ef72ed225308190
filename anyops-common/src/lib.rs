//! Wire types shared between the management server and the node agent.
//!
//! The agent serializes these over plain HTTP; the server deserializes
//! them into its registry. Keep this crate free of anything beyond
//! serde so both sides stay in lockstep.

use serde::{Deserialize, Serialize};

/// Path the agent POSTs its heartbeat to, relative to the server root.
pub const HEARTBEAT_PATH: &str = "/api/v1/agent/heartbeat";

/// Seconds between two heartbeats from a healthy agent.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// A node whose last heartbeat is older than this is reported offline.
pub const STALENESS_WINDOW_SECS: i64 = 30;

/// Port the agent's local control endpoint listens on when no config
/// file overrides it.
pub const AGENT_CONTROL_PORT: u16 = 8082;

/// Container name fragments the agent reports on. Anything else running
/// on the node is out of scope for the dashboard.
pub const MONITORED_SERVICES: &[&str] = &[
    "vllm",
    "anysearch",
    "anyzearch",
    "anythingllm",
    "anything-llm",
    "milvus",
    "lancedb",
    "chroma",
    "pgvector",
    "mineru",
];

/// One container as reported by `docker ps` on the node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    pub uptime: String,
}

/// Full telemetry sample a node sends every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_ip: String,
    pub hostname: String,
    pub status: String,
    pub cpu_usage: f64,
    pub cpu_capacity: String,
    pub memory_usage: f64,
    pub memory_capacity: String,
    pub docker_status: String,
    #[serde(default)]
    pub deployment_time: String,
    pub os_spec: String,
    pub gpu_status: String,
    #[serde(default)]
    pub services: Vec<ContainerStatus>,
}

/// Request the server relays to a node agent's control endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub container_name: String,
    pub action: String,
}

/// Immediate acknowledgement from the agent; the action itself runs in
/// the background.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub output: String,
}

/// True when a container name matches one of the monitored fragments.
pub fn is_monitored_service(name: &str) -> bool {
    let lower = name.to_lowercase();
    MONITORED_SERVICES.iter().any(|frag| lower.contains(frag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitored_service_matching_is_case_insensitive() {
        assert!(is_monitored_service("vLLM-qwen3"));
        assert!(is_monitored_service("Milvus-standalone"));
        assert!(!is_monitored_service("nginx"));
        assert!(!is_monitored_service("postgres"));
    }

    #[test]
    fn heartbeat_tolerates_missing_optional_fields() {
        let raw = r#"{
            "node_ip": "10.0.0.5",
            "hostname": "node-a",
            "status": "online",
            "cpu_usage": 12.5,
            "cpu_capacity": "32",
            "memory_usage": 40.0,
            "memory_capacity": "64G",
            "docker_status": "active",
            "os_spec": "Ubuntu 22.04.4 LTS",
            "gpu_status": "None"
        }"#;
        let hb: Heartbeat = serde_json::from_str(raw).unwrap();
        assert!(hb.services.is_empty());
        assert!(hb.deployment_time.is_empty());
    }
}
