//! Generic connectivity probes behind the deployment wizard's
//! "test connection" button.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    #[serde(default)]
    pub port: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ProbeResult {
    pub status: String,
    pub message: String,
}

impl ProbeResult {
    fn success(message: String) -> Self {
        Self {
            status: "success".to_string(),
            message,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            status: "failed".to_string(),
            message,
        }
    }
}

pub async fn probe(req: &ProbeRequest) -> ProbeResult {
    match req.kind.as_str() {
        "ssh" => probe_ssh_hosts(&req.host, &req.port).await,
        "inference" => probe_http(&req.host, &req.port, "/health").await,
        "rag_app" => probe_http(&req.host, &req.port, "/").await,
        _ => match tcp_dial(&req.host, default_port(&req.port, 80)).await {
            Ok(()) => ProbeResult::success(format!("Connected to {}", req.host)),
            Err(err) => ProbeResult::failure(err),
        },
    }
}

/// The host field is a newline-separated node list; every entry must
/// accept TCP for the aggregate to succeed.
async fn probe_ssh_hosts(hosts: &str, default: &str) -> ProbeResult {
    let targets: Vec<&str> = hosts
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if targets.is_empty() {
        return ProbeResult::failure("No target nodes supplied".to_string());
    }

    let fallback = default_port(default, 22);
    let mut failures = Vec::new();
    for target in &targets {
        let (host, port) = match target.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(fallback)),
            None => (target.to_string(), fallback),
        };
        if let Err(err) = tcp_dial(&host, port).await {
            failures.push(format!("{target}: {err}"));
        }
    }

    if failures.is_empty() {
        ProbeResult::success(format!(
            "Successfully connected to all {} nodes",
            targets.len()
        ))
    } else {
        ProbeResult::failure(format!(
            "Failed to connect {} of {} nodes: {}",
            failures.len(),
            targets.len(),
            failures.join("; ")
        ))
    }
}

/// HTTP GET against the service path, falling back to a raw TCP dial
/// for services that answer the port but not the path.
async fn probe_http(host: &str, port: &str, path: &str) -> ProbeResult {
    let port = default_port(port, 80);
    let url = format!("http://{host}:{port}{path}");
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(err) => return ProbeResult::failure(err.to_string()),
    };
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            return ProbeResult::success(format!("Service responded at {url}"))
        }
        Ok(resp) => {
            return ProbeResult::failure(format!("Service returned {} at {url}", resp.status()))
        }
        Err(_) => {}
    }
    match tcp_dial(host, port).await {
        Ok(()) => ProbeResult::success(format!("Port open at {host}:{port} (no HTTP response)")),
        Err(err) => ProbeResult::failure(err),
    }
}

async fn tcp_dial(host: &str, port: u16) -> Result<(), String> {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(format!("connect {host}:{port}: {err}")),
        Err(_) => Err(format!("connect {host}:{port}: timed out")),
    }
}

fn default_port(value: &str, fallback: u16) -> u16 {
    value.trim().parse().unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ssh_probe_aggregates_all_targets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let req = ProbeRequest {
            kind: "ssh".to_string(),
            host: format!("127.0.0.1:{port}\n127.0.0.1"),
            port: port.to_string(),
        };
        let result = probe(&req).await;
        assert_eq!(result.status, "success");
        assert_eq!(result.message, "Successfully connected to all 2 nodes");
    }

    #[tokio::test]
    async fn ssh_probe_reports_partial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        // Bind-then-drop gives a port nothing is listening on.
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let req = ProbeRequest {
            kind: "ssh".to_string(),
            host: format!("127.0.0.1:{open}\n127.0.0.1:{closed}"),
            port: String::new(),
        };
        let result = probe(&req).await;
        assert_eq!(result.status, "failed");
        assert!(result.message.contains("1 of 2"));
    }

    #[tokio::test]
    async fn empty_ssh_target_list_fails() {
        let req = ProbeRequest {
            kind: "ssh".to_string(),
            host: "\n  \n".to_string(),
            port: String::new(),
        };
        assert_eq!(probe(&req).await.status, "failed");
    }
}
