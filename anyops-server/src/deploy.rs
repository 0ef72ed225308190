//! Deployment wizard and node-facing endpoints: turning one wizard
//! submission into merged node records, capacity profiles, and
//! background agent bootstraps.

use crate::audit::{AuditLog, Level};
use crate::calculator::{self, CalculateRequest};
use crate::models::{now_rfc3339, DeploymentConfig, DeploymentNode, InferenceConfig, RagAppConfig};
use crate::registry::NodeRegistry;
use crate::ssh::SshSession;
use crate::store::{next_id, Store};
use anyhow::Result;
use anyops_common::{ContainerStatus, AGENT_CONTROL_PORT};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

/// Engines the wizard owns. Records carrying any other engine tag were
/// registered manually and survive a re-run untouched.
const MANAGED_ENGINES: &[&str] = &["vLLM", "MindIE", "RAG App", "Vector DB", "Parser", "Unknown"];

/// Inference and companion configs derived from one wizard submission.
pub fn configs_from_wizard(req: &DeploymentConfig) -> Vec<InferenceConfig> {
    let (engine, name) = match req.platform.as_str() {
        "nvidia" => ("vLLM", "vllm"),
        "ascend" => ("MindIE", "mindie"),
        _ => ("Unknown", "vllm"),
    };

    let mut configs = vec![InferenceConfig {
        name: name.to_string(),
        engine: engine.to_string(),
        model_path: req.model_name.clone(),
        ip: req.inference_host.clone(),
        port: req.inference_port.clone(),
        mode: req.mode.clone(),
        created_at: now_rfc3339(),
        ..InferenceConfig::default()
    }];

    if req.enable_rag {
        configs.push(InferenceConfig {
            name: "anythingllm".to_string(),
            engine: "RAG App".to_string(),
            ip: req.rag_host.clone(),
            port: req.rag_port.clone(),
            created_at: now_rfc3339(),
            ..InferenceConfig::default()
        });
    }
    if req.enable_vectordb {
        configs.push(InferenceConfig {
            name: req.vector_db_type.to_lowercase(),
            engine: "Vector DB".to_string(),
            ip: req.vectordb_host.clone(),
            port: req.vectordb_port.clone(),
            created_at: now_rfc3339(),
            ..InferenceConfig::default()
        });
    }
    if req.enable_parser {
        configs.push(InferenceConfig {
            name: "mineru".to_string(),
            engine: "Parser".to_string(),
            ip: req.parser_host.clone(),
            port: req.parser_port.clone(),
            created_at: now_rfc3339(),
            ..InferenceConfig::default()
        });
    }
    configs
}

/// Newline-separated target list with blanks dropped.
pub fn split_targets(target_nodes: &str) -> Vec<String> {
    target_nodes
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Applies one wizard submission to the persisted node records:
/// wizard-managed configs are replaced wholesale, manually registered
/// ones are kept, and a capacity profile is attached to the inference
/// entry.
pub fn apply_wizard(
    store: &Store,
    registry: &NodeRegistry,
    req: &DeploymentConfig,
) -> Result<Vec<InferenceConfig>> {
    let mut configs = configs_from_wizard(req);

    // Capacity profile for the primary inference service, using the
    // GPU the target node reported if it ever has.
    let targets = split_targets(&req.target_nodes);
    let gpu_memory = targets
        .first()
        .and_then(|t| registry.get(t.split(':').next().unwrap_or(t)))
        .map(|view| parse_gpu_memory(&view.gpu_status))
        .unwrap_or(24.0);
    let (profile, shape) = calculator::calculate(&CalculateRequest {
        model_name: req.model_name.clone(),
        gpu_memory_gb: gpu_memory,
        mode: req.mode.clone(),
        utilization: 0.0,
        node_ip: String::new(),
    });
    {
        let primary = &mut configs[0];
        primary.model_name = shape.name.clone();
        primary.gpu_memory_gb = gpu_memory;
        primary.max_model_len = profile.max_model_len;
        primary.max_num_seqs = profile.max_num_seqs;
        primary.max_num_batched_tokens = profile.max_num_batched_tokens;
        primary.gpu_memory_utilization = profile.gpu_memory_util;
    }

    let rag_cfgs: Vec<RagAppConfig> = if req.enable_rag {
        vec![RagAppConfig {
            name: "anythingllm".to_string(),
            host: req.rag_host.clone(),
            port: req.rag_port.clone(),
            storage_dir: "/home/anyadmin/data/anythingllm".to_string(),
            llm_provider: "generic-openai".to_string(),
            generic_openai_base_path: format!(
                "http://{}:{}/v1",
                req.inference_host, req.inference_port
            ),
            generic_openai_model_pref: req.model_name.clone(),
            generic_openai_model_token_limit: profile.max_model_len,
            generic_openai_max_tokens: profile.max_model_len.min(4096),
            vector_db: if req.enable_vectordb {
                req.vector_db_type.to_lowercase()
            } else {
                "lancedb".to_string()
            },
            ..RagAppConfig::default()
        }]
    } else {
        Vec::new()
    };

    store.write(
        |d| {
            d.mgmt_host = req.mgmt_host.clone();
            d.mgmt_port = req.mgmt_port.clone();
            for target in &targets {
                let node_ip = target.split(':').next().unwrap_or(target).to_string();
                let idx = match d.deployment_nodes.iter().position(|n| n.node_ip == node_ip) {
                    Some(i) => i,
                    None => {
                        d.deployment_nodes.push(DeploymentNode {
                            node_ip: node_ip.clone(),
                            ..DeploymentNode::default()
                        });
                        d.deployment_nodes.len() - 1
                    }
                };
                let node = &mut d.deployment_nodes[idx];
                node.inference_cfgs
                    .retain(|c| !MANAGED_ENGINES.contains(&c.engine.as_str()));
                let base = next_id(node.inference_cfgs.iter().map(|c| c.id));
                for (i, cfg) in configs.iter().enumerate() {
                    let mut cfg = cfg.clone();
                    cfg.id = base + i as u64;
                    node.inference_cfgs.push(cfg);
                }
                node.rag_app_cfgs = rag_cfgs.clone();
                node.agent_config.mgmt_host = req.mgmt_host.clone();
                node.agent_config.mgmt_port = req.mgmt_port.clone();
                node.agent_config.node_ip = node_ip;
                node.agent_config.deployment_time = now_rfc3339();
            }
        },
        true,
    )?;
    Ok(configs)
}

/// The synthetic artifact pair the dashboard shows after a submission.
pub fn wizard_artifacts(primary: &InferenceConfig) -> serde_json::Value {
    json!({
        "deploy_script.sh": "#!/bin/bash\n# Deployment Script\n# Deployment is handled automatically by the server via SSH.\n# Check the audit log for progress.",
        "config.yaml": format!(
            "model: {}\nengine: {}\nhost: {}\nport: {}",
            primary.name, primary.engine, primary.ip, primary.port
        ),
    })
}

/// Registry view for one node, with configured-but-stopped services
/// merged in so the dashboard shows what should be running. `None`
/// means the node has never heartbeated.
pub fn agent_status(
    registry: &NodeRegistry,
    store: &Store,
    ip: &str,
) -> Option<serde_json::Value> {
    let view = registry.get(ip)?;

    let configured: Vec<ContainerStatus> = store.read(|d| {
        d.deployment_nodes
            .iter()
            .find(|n| n.node_ip == ip)
            .map(|node| {
                node.inference_cfgs
                    .iter()
                    .map(|c| (c.name.clone(), c.engine.clone()))
                    .chain(
                        node.rag_app_cfgs
                            .iter()
                            .map(|c| (c.name.clone(), "RAG Application".to_string())),
                    )
                    .map(|(name, image)| ContainerStatus {
                        id: String::new(),
                        name,
                        image,
                        status: "Configured (Stopped)".to_string(),
                        state: "stopped".to_string(),
                        uptime: String::new(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    });

    let mut services = view.services.clone();
    for cfg in configured {
        if !services.iter().any(|s| s.name == cfg.name) {
            services.push(cfg);
        }
    }

    let mut data = serde_json::to_value(&view).ok()?;
    data["services"] = serde_json::to_value(services).ok()?;
    Some(data)
}

#[derive(Debug, Serialize)]
pub struct SshVerifyOutcome {
    pub status: String,
    pub message: String,
    pub success_count: usize,
    pub fail_count: usize,
    pub details: Vec<String>,
}

/// Full SSH round-trip (dial, authenticate, run a command) against
/// every listed node, with per-node outcomes.
pub async fn verify_ssh(ids: &crate::keys::IdentityStore, hosts: &str) -> SshVerifyOutcome {
    let targets = split_targets(hosts);
    let mut success = 0;
    let mut details = Vec::new();

    for target in &targets {
        let (host, port) = crate::ssh::split_host_port(target);
        let keypair = match ids.ssh_keypair() {
            Ok(k) => k,
            Err(err) => {
                details.push(format!("{host}: identity unavailable: {err}"));
                continue;
            }
        };
        match SshSession::check(&host, port, keypair).await {
            Ok(()) => success += 1,
            Err(err) => details.push(format!("{host}: {err}")),
        }
    }

    let fail = targets.len() - success;
    let (status, message) = if targets.is_empty() {
        ("error", "No target nodes supplied".to_string())
    } else if fail == 0 {
        (
            "success",
            format!("Successfully connected to all {} nodes", targets.len()),
        )
    } else if success == 0 {
        ("error", "Connectivity failed for ALL nodes.".to_string())
    } else {
        ("error", "Connectivity failed for some nodes.".to_string())
    };
    SshVerifyOutcome {
        status: status.to_string(),
        message,
        success_count: success,
        fail_count: fail,
        details,
    }
}

/// Proxies the inference engine's model list, retrying via the node's
/// agent port for engines fronted by the agent.
pub async fn fetch_vllm_models(host: &str, port: &str) -> Result<(u16, String), String> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;

    for p in [port.to_string(), AGENT_CONTROL_PORT.to_string()] {
        let url = format!("http://{host}:{p}/v1/models");
        match client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.map_err(|e| e.to_string())?;
                return Ok((status, body));
            }
            Err(err) => info!(%url, %err, "model discovery attempt failed"),
        }
    }
    Err(format!("Failed to connect to vLLM service at {host}"))
}

/// GPU memory in GB out of a heartbeat's GPU descriptor, with a
/// name-based fallback for descriptors lacking an explicit size.
pub fn parse_gpu_memory(gpu_status: &str) -> f64 {
    static MEM: OnceLock<Regex> = OnceLock::new();
    let re = MEM.get_or_init(|| Regex::new(r"Mem: \d+/(\d+) MB").unwrap());
    if let Some(caps) = re.captures(gpu_status) {
        if let Ok(mb) = caps[1].parse::<f64>() {
            return (mb / 1024.0).round();
        }
    }

    let lower = gpu_status.to_lowercase();
    for (frag, gb) in [
        ("4090", 24.0),
        ("3090", 24.0),
        ("a100", 40.0),
        ("v100", 32.0),
        ("t4", 16.0),
    ] {
        if lower.contains(frag) {
            return gb;
        }
    }
    24.0
}

/// Kicks off one background bootstrap per target node.
pub fn spawn_bootstraps(
    bootstrapper: &crate::bootstrap::Bootstrapper,
    audit: &AuditLog,
    operator: &str,
    req: &DeploymentConfig,
) {
    let targets = split_targets(&req.target_nodes);
    if targets.is_empty() || req.mgmt_host.is_empty() || req.mgmt_port.is_empty() {
        return;
    }
    let action = if req.mode == "new_deployment" {
        "服务部署"
    } else {
        "服务接入"
    };
    audit.record(
        operator,
        action,
        &format!("发起部署任务: {} 个节点", targets.len()),
        Level::Info,
    );
    for node in targets {
        let bootstrapper = bootstrapper.clone();
        let operator = operator.to_string();
        let mgmt_host = req.mgmt_host.clone();
        let mgmt_port = req.mgmt_port.clone();
        let mode = req.mode.clone();
        tokio::spawn(async move {
            bootstrapper
                .deploy_agent(&operator, &node, &mgmt_host, &mgmt_port, &mode)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_maps_to_engine_and_container_name() {
        let mut req = DeploymentConfig {
            platform: "nvidia".to_string(),
            model_name: "Qwen3-1.7B".to_string(),
            ..DeploymentConfig::default()
        };
        let configs = configs_from_wizard(&req);
        assert_eq!(configs[0].name, "vllm");
        assert_eq!(configs[0].engine, "vLLM");

        req.platform = "ascend".to_string();
        let configs = configs_from_wizard(&req);
        assert_eq!(configs[0].name, "mindie");
        assert_eq!(configs[0].engine, "MindIE");
    }

    #[test]
    fn optional_components_become_configs() {
        let req = DeploymentConfig {
            platform: "nvidia".to_string(),
            enable_rag: true,
            rag_host: "10.0.0.2".to_string(),
            rag_port: "3001".to_string(),
            enable_vectordb: true,
            vector_db_type: "Milvus".to_string(),
            enable_parser: true,
            ..DeploymentConfig::default()
        };
        let configs = configs_from_wizard(&req);
        let names: Vec<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["vllm", "anythingllm", "milvus", "mineru"]);
        assert_eq!(configs[2].engine, "Vector DB");
        assert_eq!(configs[3].engine, "Parser");
    }

    #[test]
    fn wizard_replaces_managed_configs_but_keeps_manual_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json")).unwrap();
        let registry = NodeRegistry::new();

        store
            .write(
                |d| {
                    d.deployment_nodes.push(DeploymentNode {
                        node_ip: "10.0.0.5".to_string(),
                        inference_cfgs: vec![
                            InferenceConfig {
                                id: 1,
                                name: "legacy-vllm".to_string(),
                                engine: "vLLM".to_string(),
                                ..InferenceConfig::default()
                            },
                            InferenceConfig {
                                id: 2,
                                name: "custom-embedder".to_string(),
                                engine: "Embedding".to_string(),
                                ..InferenceConfig::default()
                            },
                        ],
                        ..DeploymentNode::default()
                    });
                },
                false,
            )
            .unwrap();

        let req = DeploymentConfig {
            mgmt_host: "172.20.0.1".to_string(),
            mgmt_port: "8080".to_string(),
            target_nodes: "10.0.0.5".to_string(),
            platform: "nvidia".to_string(),
            model_name: "Qwen3-1.7B".to_string(),
            ..DeploymentConfig::default()
        };
        apply_wizard(&store, &registry, &req).unwrap();

        let names = store.read(|d| {
            d.deployment_nodes[0]
                .inference_cfgs
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        });
        assert_eq!(names, vec!["custom-embedder", "vllm"]);
        // The primary config carries a capacity profile.
        let primary = store.read(|d| d.deployment_nodes[0].inference_cfgs[1].clone());
        assert!(primary.max_model_len > 0);
        assert!(primary.max_num_batched_tokens >= primary.max_model_len);
    }

    #[test]
    fn gpu_memory_parses_heartbeat_descriptor() {
        assert_eq!(
            parse_gpu_memory("1 x NVIDIA GeForce RTX 4090 | Util: 35% | Mem: 18432/24564 MB"),
            24.0
        );
        assert_eq!(parse_gpu_memory("2 x Tesla V100"), 32.0);
        assert_eq!(parse_gpu_memory("None"), 24.0);
    }

    #[test]
    fn target_splitting_drops_blanks() {
        assert_eq!(
            split_targets(" 10.0.0.1:22 \n\n10.0.0.2\n"),
            vec!["10.0.0.1:22", "10.0.0.2"]
        );
    }
}
