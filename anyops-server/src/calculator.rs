//! Serving-capacity calculator: from a model name, a GPU memory
//! budget and an optimization mode, derive a self-consistent set of
//! vLLM knobs (context length, concurrent sequences, batched-token
//! ceiling).
//!
//! Memory model: weights at 2 bytes/param (FP16), a fixed 1.5 GB
//! system reserve, and 15% headroom for activations and allocator
//! fragmentation on top of a 20% KV safety margin. Capacities are in
//! GiB throughout.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const RESERVED_GB: f64 = 1.5;
const KV_HEADROOM: f64 = 0.85;
const KV_SAFETY: f64 = 1.20;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const KV_BLOCK_SIZE: u32 = 16;

#[derive(Debug, Clone, Deserialize)]
pub struct CalculateRequest {
    pub model_name: String,
    #[serde(rename = "gpu_memory_size", alias = "gpu_memory_gb", default)]
    pub gpu_memory_gb: f64,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub utilization: f64,
    #[serde(default)]
    pub node_ip: String,
}

/// Architectural shape inferred from the model name.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelShape {
    pub name: String,
    pub params_billion: f64,
    pub hidden_size: u32,
    pub num_hidden_layers: u32,
    pub num_attention_heads: u32,
    pub num_key_value_heads: u32,
    pub head_dim: u32,
    pub max_position_embeddings: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VllmConfig {
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    pub max_num_batched_tokens: u32,
    pub gpu_memory_util: f64,
    pub swap_space_gb: u32,
    pub enable_prefix_caching: bool,
    pub kv_block_size: u32,
}

/// Billions of parameters extracted from a model name. Explicit size
/// suffixes win; size words cover the rest; unknown names assume 7B.
pub fn params_from_name(model_name: &str) -> f64 {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    let lower = model_name.to_lowercase();

    let re = SUFFIX.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)b").unwrap());
    if let Some(caps) = re.captures(&lower) {
        if let Ok(v) = caps[1].parse::<f64>() {
            return v;
        }
    }

    for (word, params) in [
        ("tiny", 0.1),
        ("small", 0.3),
        ("medium", 1.5),
        ("xlarge", 13.0),
        ("large", 7.0),
    ] {
        if lower.contains(word) {
            return params;
        }
    }

    // Qwen3 variants are often named by sub-size without the B suffix.
    if lower.contains("qwen3") {
        for (frag, params) in [("0.5", 0.5), ("1.5", 1.5), ("1.7", 1.7), ("14", 14.0), ("4", 4.0), ("7", 7.0)] {
            if lower.contains(frag) {
                return params;
            }
        }
    }

    7.0
}

/// Maps a parameter count onto a representative transformer shape.
pub fn shape_from_name(model_name: &str) -> ModelShape {
    let params = params_from_name(model_name);
    let (hidden, layers, heads, mut ctx) = match params {
        p if p <= 1.0 => (1024, 12, 12, 8192),
        p if p <= 1.7 => (1536, 16, 12, 131072),
        p if p <= 3.0 => (2048, 24, 16, 32768),
        p if p <= 7.0 => (4096, 32, 32, 32768),
        p if p <= 13.0 => (5120, 40, 40, 32768),
        p if p <= 34.0 => (8192, 60, 64, 131072),
        _ => (8192, 80, 64, 131072),
    };

    let lower = model_name.to_lowercase();
    if lower.contains("qwen") {
        ctx = if lower.contains("qwen3") { 131072 } else { 32768 };
    }

    ModelShape {
        name: model_name.to_string(),
        params_billion: params,
        hidden_size: hidden,
        num_hidden_layers: layers,
        num_attention_heads: heads,
        num_key_value_heads: heads,
        head_dim: hidden / heads,
        max_position_embeddings: ctx,
    }
}

fn align_down(value: u32, alignment: u32) -> u32 {
    (value / alignment).max(1) * alignment
}

fn effective_util(gpu_memory_gb: f64, requested: f64) -> f64 {
    let util = if requested <= 0.0 { 0.9 } else { requested };
    if gpu_memory_gb < 8.0 && util > 0.85 {
        0.85
    } else {
        util
    }
}

/// KV-cache bytes one token occupies (K and V, FP16, safety margin).
fn kv_bytes_per_token(shape: &ModelShape) -> f64 {
    2.0 * shape.num_hidden_layers as f64
        * shape.num_key_value_heads as f64
        * shape.head_dim as f64
        * 2.0
        * KV_SAFETY
}

pub fn calculate(req: &CalculateRequest) -> (VllmConfig, ModelShape) {
    let shape = shape_from_name(&req.model_name);
    let util = effective_util(req.gpu_memory_gb, req.utilization);
    let mode = if req.mode.is_empty() {
        "balanced"
    } else {
        req.mode.as_str()
    };

    let weight_gb = shape.params_billion * 2.0;
    let raw_budget = (req.gpu_memory_gb * util - weight_gb - RESERVED_GB) * KV_HEADROOM;
    let budget_floor = if mode == "max_token" { 0.5 } else { 1.0 };
    let kv_budget_gb = raw_budget.max(budget_floor);
    let capacity = ((kv_budget_gb * BYTES_PER_GB) / kv_bytes_per_token(&shape)) as u32;

    let ctx = shape.max_position_embeddings;
    let (max_model_len, max_num_seqs, max_num_batched_tokens) = match mode {
        "max_token" => {
            let len = align_down(capacity.min(ctx).max(2048), 128);
            let seqs = if kv_budget_gb > 4.0 { 2 } else { 1 };
            (len, seqs, len)
        }
        "max_concurrency" => {
            let tier = if req.gpu_memory_gb < 8.0 {
                2048
            } else if req.gpu_memory_gb <= 16.0 {
                4096
            } else {
                8192
            };
            let len = align_down(tier.min(capacity).min(ctx).max(128), 128);
            let seqs = (capacity / len).clamp(1, 256);
            let batched = (len * seqs).min(capacity).max(len);
            (len, seqs, batched)
        }
        _ => {
            let tier = if req.gpu_memory_gb < 6.0 {
                2048
            } else if req.gpu_memory_gb < 12.0 {
                4096
            } else if req.gpu_memory_gb < 24.0 {
                8192
            } else {
                16384
            };
            let len = align_down(tier.min(capacity).min(ctx).max(256), 256);
            let seqs = (capacity / len).clamp(2, 8);
            let batched = (2 * len).min(capacity).min(32768).max(len);
            (len, seqs, batched)
        }
    };

    let config = VllmConfig {
        max_model_len,
        max_num_seqs,
        max_num_batched_tokens,
        gpu_memory_util: util,
        swap_space_gb: if req.gpu_memory_gb < 16.0 { 8 } else { 0 },
        enable_prefix_caching: true,
        kv_block_size: KV_BLOCK_SIZE,
    };
    (config, shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str, gpu: f64, mode: &str, util: f64) -> CalculateRequest {
        CalculateRequest {
            model_name: model.to_string(),
            gpu_memory_gb: gpu,
            mode: mode.to_string(),
            utilization: util,
            node_ip: String::new(),
        }
    }

    #[test]
    fn params_extraction_handles_common_spellings() {
        assert_eq!(params_from_name("Qwen3-1.7B"), 1.7);
        assert_eq!(params_from_name("llama-2-13b-chat"), 13.0);
        assert_eq!(params_from_name("deepseek-7B"), 7.0);
        assert_eq!(params_from_name("bert-large"), 7.0);
        assert_eq!(params_from_name("gpt-tiny"), 0.1);
        // Unknown names assume a mid-size model.
        assert_eq!(params_from_name("mystery-model"), 7.0);
    }

    #[test]
    fn shape_ladder_matches_known_models() {
        let shape = shape_from_name("Qwen3-1.7B");
        assert_eq!(shape.hidden_size, 1536);
        assert_eq!(shape.num_hidden_layers, 16);
        assert_eq!(shape.num_attention_heads, 12);
        assert_eq!(shape.head_dim, 128);
        assert_eq!(shape.max_position_embeddings, 131072);

        // Non-qwen3 qwen models are capped at 32k context.
        assert_eq!(shape_from_name("Qwen2-7B").max_position_embeddings, 32768);
    }

    #[test]
    fn qwen3_17b_on_24gb_max_concurrency() {
        let (cfg, shape) = calculate(&request("Qwen3-1.7B", 24.0, "max_concurrency", 0.9));
        assert_eq!(shape.params_billion, 1.7);
        assert_eq!(cfg.max_model_len, 8192);
        assert!(cfg.max_num_seqs >= 4);
        assert!(cfg.enable_prefix_caching);
        assert!(cfg.max_num_batched_tokens >= cfg.max_model_len);
        assert_eq!(cfg.gpu_memory_util, 0.9);
        assert_eq!(cfg.swap_space_gb, 0);
    }

    #[test]
    fn small_gpu_caps_utilization_quietly() {
        let (cfg, _) = calculate(&request("Qwen3-1.7B", 6.0, "balanced", 0.9));
        assert_eq!(cfg.gpu_memory_util, 0.85);
        let (cfg, _) = calculate(&request("Qwen3-1.7B", 6.0, "balanced", 0.8));
        assert_eq!(cfg.gpu_memory_util, 0.8);
        let (cfg, _) = calculate(&request("Qwen3-1.7B", 8.0, "balanced", 0.9));
        assert_eq!(cfg.gpu_memory_util, 0.9);
    }

    #[test]
    fn batched_tokens_never_fall_below_model_len() {
        for mode in ["max_token", "max_concurrency", "balanced"] {
            for gpu in [4.0, 8.0, 16.0, 24.0, 80.0] {
                for model in ["Qwen3-0.6B", "Qwen3-1.7B", "llama-13b", "llama-70b"] {
                    let (cfg, _) = calculate(&request(model, gpu, mode, 0.0));
                    assert!(
                        cfg.max_num_batched_tokens >= cfg.max_model_len,
                        "{mode} {model} {gpu}: {} < {}",
                        cfg.max_num_batched_tokens,
                        cfg.max_model_len
                    );
                    assert!(cfg.max_num_seqs >= 1);
                }
            }
        }
    }

    #[test]
    fn max_token_mode_prefers_context_length() {
        // 80 GB leaves room beyond the 131k context window.
        let (cfg, shape) = calculate(&request("Qwen3-1.7B", 80.0, "max_token", 0.9));
        assert_eq!(cfg.max_model_len, shape.max_position_embeddings);
        assert_eq!(cfg.max_num_seqs, 2);
    }

    #[test]
    fn balanced_mode_aligns_to_256() {
        let (cfg, _) = calculate(&request("llama-7b", 24.0, "balanced", 0.9));
        assert_eq!(cfg.max_model_len % 256, 0);
        assert!(cfg.max_num_seqs >= 2 && cfg.max_num_seqs <= 8);
        assert!(cfg.max_num_batched_tokens <= 32768);
    }

    #[test]
    fn default_mode_is_balanced_and_default_util_09() {
        let (a, _) = calculate(&request("llama-7b", 24.0, "", 0.0));
        let (b, _) = calculate(&request("llama-7b", 24.0, "balanced", 0.9));
        assert_eq!(a, b);
    }
}
