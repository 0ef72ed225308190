//! Domain records persisted in the data blob and served over the API.
//!
//! Field names mirror what the dashboard already expects on the wire,
//! so renames here are breaking changes.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct User {
    pub id: u64,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    pub username: String,
    /// Base64 PKCS#1 v1.5 ciphertext under the server's RSA key.
    pub password: String,
    pub role: String,
}

/// Serving parameters for one inference engine instance on a node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InferenceConfig {
    pub id: u64,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    pub name: String,
    pub engine: String,
    pub model_name: String,
    #[serde(default)]
    pub model_path: String,
    pub ip: String,
    pub port: String,
    #[serde(default)]
    pub mode: String,
    #[serde(rename = "gpu_memory_size", default)]
    pub gpu_memory_gb: f64,
    #[serde(default)]
    pub gpu_utilization: f64,
    #[serde(default)]
    pub max_model_len: u32,
    #[serde(default)]
    pub max_num_seqs: u32,
    #[serde(default)]
    pub max_num_batched_tokens: u32,
    #[serde(default)]
    pub gpu_memory_utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagAppConfig {
    pub name: String,
    pub host: String,
    pub port: String,
    #[serde(default)]
    pub storage_dir: String,
    #[serde(default)]
    pub llm_provider: String,
    #[serde(default)]
    pub generic_openai_base_path: String,
    #[serde(default)]
    pub generic_openai_model_pref: String,
    #[serde(default)]
    pub generic_openai_model_token_limit: u32,
    #[serde(default)]
    pub generic_openai_max_tokens: u32,
    #[serde(rename = "generic_openai_api_key", default)]
    pub generic_openai_key: String,
    #[serde(default)]
    pub vector_db: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentFileConfig {
    pub deployment_time: String,
    #[serde(default)]
    pub log_file: String,
    pub mgmt_host: String,
    pub mgmt_port: String,
    pub node_ip: String,
    #[serde(default)]
    pub node_port: String,
}

/// One managed node and everything configured to run on it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentNode {
    pub node_ip: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub agent_config: AgentFileConfig,
    #[serde(default)]
    pub inference_cfgs: Vec<InferenceConfig>,
    #[serde(default)]
    pub rag_app_cfgs: Vec<RagAppConfig>,
}

/// What the deployment wizard submits.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentConfig {
    pub mgmt_host: String,
    pub mgmt_port: String,
    pub target_nodes: String,
    #[serde(default)]
    pub mode: String,
    pub platform: String,
    #[serde(default)]
    pub inference_host: String,
    #[serde(default)]
    pub inference_port: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub enable_rag: bool,
    #[serde(default)]
    pub rag_host: String,
    #[serde(default)]
    pub rag_port: String,
    #[serde(default)]
    pub enable_vectordb: bool,
    #[serde(rename = "vector_db", default)]
    pub vector_db_type: String,
    #[serde(default)]
    pub vectordb_host: String,
    #[serde(default)]
    pub vectordb_port: String,
    #[serde(default)]
    pub enable_parser: bool,
    #[serde(default)]
    pub parser_host: String,
    #[serde(default)]
    pub parser_port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImportTask {
    pub id: u64,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    pub name: String,
    #[serde(rename = "sourceType", default)]
    pub source_type: String,
    #[serde(rename = "sourcePath", default)]
    pub source_path: String,
    pub status: String,
    pub progress: u32,
    #[serde(rename = "totalFiles", default)]
    pub total_files: u32,
    #[serde(default)]
    pub processed: u32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupRecord {
    pub id: u64,
    #[serde(rename = "createdAt", default)]
    pub created_at: String,
    pub name: String,
    pub path: String,
    pub size: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}
