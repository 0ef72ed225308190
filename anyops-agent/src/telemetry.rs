//! Node telemetry: CPU, memory, docker, GPU and OS probes.
//!
//! Parsing is split from sampling so the line-format logic stays
//! testable without a live /proc or docker daemon.

use anyops_common::{is_monitored_service, ContainerStatus};
use std::time::Duration;
use tokio::process::Command;

/// Gap between the two /proc/stat readings used for the CPU delta.
const CPU_SAMPLE_GAP: Duration = Duration::from_millis(200);

/// Extracts (idle, total) jiffies from the aggregate `cpu` line.
pub fn parse_proc_stat(contents: &str) -> Option<(u64, u64)> {
    let line = contents
        .lines()
        .find(|l| l.starts_with("cpu ") || *l == "cpu")?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3];
    let total: u64 = fields.iter().sum();
    Some((idle, total))
}

/// Busy share between two /proc/stat readings, as a percentage.
/// A zero total delta (two reads in the same jiffy) reports 0.
pub fn cpu_percent(idle0: u64, total0: u64, idle1: u64, total1: u64) -> f64 {
    let total_delta = total1.saturating_sub(total0);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = idle1.saturating_sub(idle0);
    (1.0 - idle_delta as f64 / total_delta as f64) * 100.0
}

pub async fn sample_cpu() -> f64 {
    let first = match read_proc_stat().await {
        Some(v) => v,
        None => return 0.0,
    };
    tokio::time::sleep(CPU_SAMPLE_GAP).await;
    let second = match read_proc_stat().await {
        Some(v) => v,
        None => return 0.0,
    };
    cpu_percent(first.0, first.1, second.0, second.1)
}

async fn read_proc_stat() -> Option<(u64, u64)> {
    let contents = tokio::fs::read_to_string("/proc/stat").await.ok()?;
    parse_proc_stat(&contents)
}

/// Used-memory percentage from /proc/meminfo, via MemAvailable.
pub fn parse_meminfo(contents: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        contents
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

pub async fn sample_memory() -> f64 {
    match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(contents) => parse_meminfo(&contents).unwrap_or(0.0),
        Err(_) => 0.0,
    }
}

/// Number of logical CPUs, via nproc.
pub async fn cpu_capacity() -> String {
    match run("nproc", &[]).await {
        Some(out) => out.trim().to_string(),
        None => "unknown".to_string(),
    }
}

/// Human-readable total memory. Prefers `free -h`, falls back to a
/// MemTotal read when the tool is missing.
pub async fn memory_capacity() -> String {
    if let Some(out) = run("free", &["-h"]).await {
        for line in out.lines() {
            if line.starts_with("Mem:") {
                if let Some(total) = line.split_whitespace().nth(1) {
                    return total.to_string();
                }
            }
        }
    }
    if let Ok(contents) = tokio::fs::read_to_string("/proc/meminfo").await {
        if let Some(line) = contents.lines().find(|l| l.starts_with("MemTotal:")) {
            if let Some(kb) = line.split_whitespace().nth(1).and_then(|v| v.parse::<f64>().ok()) {
                return format!("{:.1}G", kb / 1024.0 / 1024.0);
            }
        }
    }
    "unknown".to_string()
}

/// Docker daemon reachability. `docker info` succeeding means the
/// daemon is up, regardless of what it prints.
pub async fn docker_status() -> String {
    let reachable = Command::new("docker")
        .arg("info")
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);
    if reachable { "active" } else { "inactive" }.to_string()
}

const DOCKER_PS_FORMAT: &str =
    "{{.ID}}|{{.Names}}|{{.Image}}|{{.Status}}|{{.State}}|{{.RunningFor}}";

/// Parses `docker ps` output in the pipe-delimited format above,
/// keeping only the monitored service containers.
pub fn parse_docker_ps(output: &str) -> Vec<ContainerStatus> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() != 6 {
                return None;
            }
            if !is_monitored_service(parts[1]) {
                return None;
            }
            Some(ContainerStatus {
                id: parts[0].to_string(),
                name: parts[1].to_string(),
                image: parts[2].to_string(),
                status: parts[3].to_string(),
                state: parts[4].to_string(),
                uptime: parts[5].to_string(),
            })
        })
        .collect()
}

pub async fn docker_services() -> Vec<ContainerStatus> {
    match run("docker", &["ps", "--format", DOCKER_PS_FORMAT]).await {
        Some(out) => parse_docker_ps(&out),
        None => Vec::new(),
    }
}

/// Builds the one-line GPU summary from nvidia-smi CSV output. One
/// line per card; the first card's figures stand in for the fleet.
pub fn parse_nvidia_smi(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let first = lines.first()?;
    let fields: Vec<&str> = first.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }
    Some(format!(
        "{} x {} | Util: {}% | Mem: {}/{} MB",
        lines.len(),
        fields[0],
        fields[1],
        fields[2],
        fields[3]
    ))
}

/// GPU accelerator summary: NVIDIA first, Ascend NPU fallback, else
/// "None".
pub async fn gpu_status() -> String {
    if let Some(out) = run(
        "nvidia-smi",
        &[
            "--query-gpu=name,utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ],
    )
    .await
    {
        if let Some(summary) = parse_nvidia_smi(&out) {
            return summary;
        }
    }
    if run("npu-smi", &["info"]).await.is_some() {
        return "Ascend NPU".to_string();
    }
    "None".to_string()
}

/// OS description: PRETTY_NAME from /etc/os-release, lsb_release as a
/// fallback.
pub async fn os_spec() -> String {
    if let Ok(contents) = tokio::fs::read_to_string("/etc/os-release").await {
        if let Some(name) = parse_os_release(&contents) {
            return name;
        }
    }
    if let Some(out) = run("lsb_release", &["-ds"]).await {
        let trimmed = out.trim().trim_matches('"');
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    "unknown".to_string()
}

pub fn parse_os_release(contents: &str) -> Option<String> {
    contents
        .lines()
        .find(|l| l.starts_with("PRETTY_NAME="))
        .map(|l| l["PRETTY_NAME=".len()..].trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

/// Runs a command, returning stdout only on a zero exit status.
async fn run(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().await.ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_stat_aggregate_line_parses() {
        let contents = "cpu  100 5 20 800 30 0 5 0 0 0\ncpu0 50 2 10 400 15 0 2 0 0 0\n";
        let (idle, total) = parse_proc_stat(contents).unwrap();
        assert_eq!(idle, 800);
        assert_eq!(total, 960);
    }

    #[test]
    fn cpu_percent_matches_delta_formula() {
        // 60 busy jiffies out of a 100-jiffy window.
        let pct = cpu_percent(800, 960, 840, 1060);
        assert!((pct - 60.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_zero_total_delta_is_zero() {
        assert_eq!(cpu_percent(800, 960, 800, 960), 0.0);
    }

    #[test]
    fn meminfo_uses_mem_available() {
        let contents = "MemTotal:       16000000 kB\nMemFree:         2000000 kB\nMemAvailable:    4000000 kB\n";
        let pct = parse_meminfo(contents).unwrap();
        assert!((pct - 75.0).abs() < 1e-9);
    }

    #[test]
    fn docker_ps_filters_unmonitored_containers() {
        let out = "abc123|vllm-qwen3|vllm/vllm-openai:v0.8|Up 2 hours|running|2 hours\n\
                   def456|nginx-proxy|nginx:latest|Up 3 days|running|3 days\n\
                   0a1b2c|milvus-standalone|milvusdb/milvus:v2.4|Up 5 hours|running|5 hours\n";
        let services = parse_docker_ps(out);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "vllm-qwen3");
        assert_eq!(services[0].state, "running");
        assert_eq!(services[1].name, "milvus-standalone");
    }

    #[test]
    fn docker_ps_skips_malformed_lines() {
        assert!(parse_docker_ps("not|enough|fields\n").is_empty());
    }

    #[test]
    fn nvidia_smi_summary_counts_cards() {
        let out = "NVIDIA GeForce RTX 4090, 35, 18432, 24564\n\
                   NVIDIA GeForce RTX 4090, 12, 1024, 24564\n";
        assert_eq!(
            parse_nvidia_smi(out).unwrap(),
            "2 x NVIDIA GeForce RTX 4090 | Util: 35% | Mem: 18432/24564 MB"
        );
    }

    #[test]
    fn os_release_pretty_name_unquoted() {
        let contents = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\n";
        assert_eq!(parse_os_release(contents).unwrap(), "Ubuntu 22.04.4 LTS");
    }
}
