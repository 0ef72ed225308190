//! Heartbeat registry: last-known state per node, keyed by the
//! operator-supplied node IP.
//!
//! Writes are a plain replace; staleness is never stored, it is
//! derived from the receive timestamp at read time so a stopped
//! server process cannot leave nodes frozen as "online".

use anyops_common::{ContainerStatus, Heartbeat, STALENESS_WINDOW_SECS};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone)]
struct NodeRecord {
    heartbeat: Heartbeat,
    last_seen: OffsetDateTime,
}

/// Registry snapshot row as the dashboard consumes it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_ip: String,
    pub hostname: String,
    pub status: String,
    pub cpu_usage: f64,
    pub cpu_capacity: String,
    pub memory_usage: f64,
    pub memory_capacity: String,
    pub docker_status: String,
    pub deployment_time: String,
    pub os_spec: String,
    pub gpu_status: String,
    pub services: Vec<ContainerStatus>,
    pub last_seen: String,
}

#[derive(Clone, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<HashMap<String, NodeRecord>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat, replacing whatever the node reported last.
    /// A node occupies exactly one slot; re-registration refreshes it.
    pub fn record(&self, heartbeat: Heartbeat) {
        let mut map = self.inner.write();
        map.insert(
            heartbeat.node_ip.clone(),
            NodeRecord {
                heartbeat,
                last_seen: OffsetDateTime::now_utc(),
            },
        );
    }

    pub fn get(&self, node_ip: &str) -> Option<NodeView> {
        let now = OffsetDateTime::now_utc();
        self.inner.read().get(node_ip).map(|rec| to_view(rec, now))
    }

    pub fn all(&self) -> Vec<NodeView> {
        let now = OffsetDateTime::now_utc();
        let mut views: Vec<NodeView> = self
            .inner
            .read()
            .values()
            .map(|rec| to_view(rec, now))
            .collect();
        views.sort_by(|a, b| a.node_ip.cmp(&b.node_ip));
        views
    }

    pub fn online_count(&self) -> usize {
        self.all().iter().filter(|v| v.status == "online").count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[cfg(test)]
    fn backdate(&self, node_ip: &str, by: Duration) {
        if let Some(rec) = self.inner.write().get_mut(node_ip) {
            rec.last_seen -= by;
        }
    }
}

fn to_view(rec: &NodeRecord, now: OffsetDateTime) -> NodeView {
    let hb = &rec.heartbeat;
    let stale = now - rec.last_seen > Duration::seconds(STALENESS_WINDOW_SECS);
    NodeView {
        node_ip: hb.node_ip.clone(),
        hostname: hb.hostname.clone(),
        status: if stale {
            "offline".to_string()
        } else {
            hb.status.clone()
        },
        cpu_usage: hb.cpu_usage,
        cpu_capacity: hb.cpu_capacity.clone(),
        memory_usage: hb.memory_usage,
        memory_capacity: hb.memory_capacity.clone(),
        docker_status: hb.docker_status.clone(),
        deployment_time: hb.deployment_time.clone(),
        os_spec: hb.os_spec.clone(),
        gpu_status: hb.gpu_status.clone(),
        services: hb.services.clone(),
        last_seen: rec.last_seen.format(&Rfc3339).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(ip: &str) -> Heartbeat {
        Heartbeat {
            node_ip: ip.to_string(),
            hostname: "node".to_string(),
            status: "online".to_string(),
            cpu_usage: 10.0,
            cpu_capacity: "8".to_string(),
            memory_usage: 20.0,
            memory_capacity: "32G".to_string(),
            docker_status: "active".to_string(),
            deployment_time: String::new(),
            os_spec: "Ubuntu 22.04.4 LTS".to_string(),
            gpu_status: "None".to_string(),
            services: Vec::new(),
        }
    }

    #[test]
    fn fresh_node_reports_online() {
        let reg = NodeRegistry::new();
        reg.record(heartbeat("10.0.0.1"));
        assert_eq!(reg.get("10.0.0.1").unwrap().status, "online");
    }

    #[test]
    fn node_past_the_window_reports_offline() {
        let reg = NodeRegistry::new();
        reg.record(heartbeat("10.0.0.1"));
        reg.backdate("10.0.0.1", Duration::seconds(STALENESS_WINDOW_SECS + 5));
        assert_eq!(reg.get("10.0.0.1").unwrap().status, "offline");
    }

    #[test]
    fn reregistration_refreshes_in_place() {
        let reg = NodeRegistry::new();
        reg.record(heartbeat("10.0.0.1"));
        reg.backdate("10.0.0.1", Duration::seconds(60));
        reg.record(heartbeat("10.0.0.1"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("10.0.0.1").unwrap().status, "online");
    }

    #[test]
    fn unknown_node_is_absent_not_offline() {
        let reg = NodeRegistry::new();
        assert!(reg.get("10.9.9.9").is_none());
    }
}
