//! Node agent: posts a telemetry heartbeat to the management server on
//! a fixed tick and exposes a local control endpoint for container
//! actions.

mod config;
mod control;
mod telemetry;

use anyhow::{Context, Result};
use anyops_common::{Heartbeat, AGENT_CONTROL_PORT, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_PATH};
use clap::Parser;
use config::AgentConfig;
use control::ComposeContext;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "anyops-agent", about = "AnyOps node agent")]
struct Args {
    /// Management server base URL, e.g. http://172.20.0.1:8080
    #[arg(long)]
    server: Option<String>,

    /// Address this node is registered under
    #[arg(long)]
    ip: Option<String>,

    /// Path to config.json written by the deployer
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();

    // The deployer rewrites config.json on every redeploy, so the file
    // wins over whatever flags the old launch line carried.
    let file_cfg = if args.config.exists() {
        match AgentConfig::load(&args.config) {
            Ok(cfg) => {
                info!(path = %args.config.display(), "loaded config file");
                Some(cfg)
            }
            Err(err) => {
                warn!(%err, "config file unreadable, falling back to flags");
                None
            }
        }
    } else {
        None
    };

    let server_url = file_cfg
        .as_ref()
        .and_then(|c| c.server_url())
        .or(args.server)
        .context("no management server: pass --server or provide config.json")?;
    let node_ip = file_cfg
        .as_ref()
        .map(|c| c.node_ip.clone())
        .filter(|ip| !ip.is_empty())
        .or(args.ip)
        .context("no node address: pass --ip or provide config.json")?;
    let deployment_time = file_cfg
        .as_ref()
        .map(|c| c.deployment_time.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    let control_port = file_cfg
        .as_ref()
        .map(|c| c.control_port)
        .filter(|p| *p != 0)
        .unwrap_or(AGENT_CONTROL_PORT);

    info!(%server_url, %node_ip, control_port, "agent starting");

    let control_addr = SocketAddr::from(([0, 0, 0, 0], control_port));
    let listener = tokio::net::TcpListener::bind(control_addr)
        .await
        .with_context(|| format!("binding control endpoint on {control_addr}"))?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, control::build_router(ComposeContext::default())).await {
            error!(%err, "control endpoint terminated");
        }
    });

    // Proxy settings on managed nodes routinely point at gateways that
    // cannot reach the management network.
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building heartbeat client")?;
    let endpoint = format!("{}{}", server_url.trim_end_matches('/'), HEARTBEAT_PATH);

    let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let hb = collect_heartbeat(&node_ip, &deployment_time).await;
                match client.post(&endpoint).json(&hb).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!(status = %resp.status(), "heartbeat rejected"),
                    Err(err) => warn!(%err, "heartbeat delivery failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

async fn collect_heartbeat(node_ip: &str, deployment_time: &str) -> Heartbeat {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    Heartbeat {
        node_ip: node_ip.to_string(),
        hostname,
        status: "online".to_string(),
        cpu_usage: telemetry::sample_cpu().await,
        cpu_capacity: telemetry::cpu_capacity().await,
        memory_usage: telemetry::sample_memory().await,
        memory_capacity: telemetry::memory_capacity().await,
        docker_status: telemetry::docker_status().await,
        deployment_time: deployment_time.to_string(),
        os_spec: telemetry::os_spec().await,
        gpu_status: telemetry::gpu_status().await,
        services: telemetry::docker_services().await,
    }
}
