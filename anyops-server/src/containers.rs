//! Routes container start/stop/restart actions from the dashboard to
//! the agent running on the target node.

use crate::audit::{AuditLog, Level};
use anyops_common::{ControlRequest, ControlResponse, AGENT_CONTROL_PORT};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerActionRequest {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub node_ip: String,
}

fn is_local(node_ip: &str) -> bool {
    node_ip.is_empty() || node_ip == "127.0.0.1" || node_ip == "localhost"
}

/// Fires the action at the node's agent and returns immediately. The
/// outcome only surfaces through logs; the dashboard polls the
/// heartbeat registry to see the container state change.
pub fn dispatch(audit: &AuditLog, operator: &str, req: ContainerActionRequest) {
    audit.record(
        operator,
        "容器控制",
        &format!(
            "对节点 {} 的容器 {} 执行了 {} 操作",
            req.node_ip, req.name, req.action
        ),
        Level::Info,
    );

    if is_local(&req.node_ip) {
        info!(container = %req.name, "local node action, nothing to relay");
        return;
    }

    tokio::spawn(async move {
        let url = format!(
            "http://{}:{}/container/control",
            req.node_ip, AGENT_CONTROL_PORT
        );
        let payload = ControlRequest {
            container_name: req.name.clone(),
            action: req.action.clone(),
        };
        let client = match reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                warn!(%err, "building agent client failed");
                return;
            }
        };
        match client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                let ack: ControlResponse = resp.json().await.unwrap_or(ControlResponse {
                    success: true,
                    message: String::new(),
                    output: String::new(),
                });
                info!(
                    node = %req.node_ip,
                    container = %req.name,
                    action = %req.action,
                    message = %ack.message,
                    "agent accepted container action"
                );
            }
            Ok(resp) => warn!(
                node = %req.node_ip,
                container = %req.name,
                status = %resp.status(),
                "agent rejected container action"
            ),
            Err(err) => warn!(
                node = %req.node_ip,
                container = %req.name,
                %err,
                "failed to reach agent"
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_addresses_are_local() {
        assert!(is_local(""));
        assert!(is_local("127.0.0.1"));
        assert!(is_local("localhost"));
        assert!(!is_local("10.0.0.5"));
    }
}
