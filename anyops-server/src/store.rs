//! Persisted data blob: users, node records, import tasks and backup
//! records in one pretty-printed JSON file.
//!
//! All access goes through `read`/`write` closures so the lock scope
//! stays obvious at the call site. A persisting write serializes to a
//! temp file in the same directory and renames it over the blob, so a
//! crash mid-save never leaves a truncated file behind.

use crate::models::{now_rfc3339, BackupRecord, DeploymentNode, ImportTask, User};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DATA_FILE: &str = "data.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataSet {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub import_tasks: Vec<ImportTask>,
    #[serde(default)]
    pub backup_records: Vec<BackupRecord>,
    #[serde(default)]
    pub deployment_nodes: Vec<DeploymentNode>,
    #[serde(default)]
    pub mgmt_host: String,
    #[serde(default)]
    pub mgmt_port: String,
}

#[derive(Clone)]
pub struct Store {
    data: Arc<RwLock<DataSet>>,
    path: PathBuf,
}

impl Store {
    /// Opens the blob at `path`, creating a seeded one when missing.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no data file, seeding defaults");
                seed_defaults()
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let store = Self {
            data: Arc::new(RwLock::new(data)),
            path,
        };
        store.persist(&store.data.read())?;
        Ok(store)
    }

    /// Probes `data.json` upward from the working directory so the
    /// server finds its blob whether launched from the repo root or a
    /// packaging subdirectory.
    pub fn default_path() -> PathBuf {
        let mut dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        loop {
            let candidate = dir.join(DATA_FILE);
            if candidate.exists() {
                return candidate;
            }
            if !dir.pop() {
                return PathBuf::from(DATA_FILE);
            }
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&DataSet) -> R) -> R {
        f(&self.data.read())
    }

    /// Applies `f` under the write lock; with `persist` the mutated
    /// blob is flushed before the lock is released, so readers never
    /// observe state that predates what is on disk.
    pub fn write<R>(&self, f: impl FnOnce(&mut DataSet) -> R, persist: bool) -> Result<R> {
        let mut guard = self.data.write();
        let out = f(&mut guard);
        if persist {
            self.persist(&guard)?;
        }
        Ok(out)
    }

    fn persist(&self, data: &DataSet) -> Result<()> {
        let raw = serde_json::to_string_pretty(data).context("serializing data blob")?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Next free id within a list of records carrying numeric ids.
pub fn next_id(ids: impl Iterator<Item = u64>) -> u64 {
    ids.max().unwrap_or(0) + 1
}

fn seed_defaults() -> DataSet {
    if std::env::var("ANYOPS_MGMT_HOST").is_err() {
        warn!("ANYOPS_MGMT_HOST not set, agents will be pointed at the default management address");
    }
    DataSet {
        users: vec![
            User {
                id: 1,
                created_at: now_rfc3339(),
                username: "admin".to_string(),
                password: "password".to_string(),
                role: "admin".to_string(),
            },
            User {
                id: 2,
                created_at: now_rfc3339(),
                username: "operator_01".to_string(),
                password: "password".to_string(),
                role: "operator".to_string(),
            },
        ],
        mgmt_host: std::env::var("ANYOPS_MGMT_HOST").unwrap_or_else(|_| "172.20.0.1".to_string()),
        mgmt_port: std::env::var("ANYOPS_MGMT_PORT").unwrap_or_else(|_| "8080".to_string()),
        ..DataSet::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_the_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DATA_FILE);

        let store = Store::open(path.clone()).unwrap();
        store
            .write(
                |d| {
                    d.deployment_nodes.push(DeploymentNode {
                        node_ip: "10.0.0.7".to_string(),
                        hostname: "gpu-a".to_string(),
                        ..DeploymentNode::default()
                    });
                },
                true,
            )
            .unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();

        let reopened = Store::open(path.clone()).unwrap();
        assert_eq!(
            reopened.read(|d| d.deployment_nodes[0].node_ip.clone()),
            "10.0.0.7"
        );
        // Reopening a clean blob must not rewrite its contents.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), saved);
    }

    #[test]
    fn missing_blob_is_seeded_with_default_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join(DATA_FILE)).unwrap();
        let usernames = store.read(|d| {
            d.users
                .iter()
                .map(|u| u.username.clone())
                .collect::<Vec<_>>()
        });
        assert_eq!(usernames, vec!["admin", "operator_01"]);
    }

    #[test]
    fn unpersisted_write_stays_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DATA_FILE);
        let store = Store::open(path.clone()).unwrap();
        store
            .write(|d| d.mgmt_host = "10.1.1.1".to_string(), false)
            .unwrap();
        let reopened = Store::open(path).unwrap();
        assert_ne!(reopened.read(|d| d.mgmt_host.clone()), "10.1.1.1");
    }

    #[test]
    fn next_id_skips_existing() {
        assert_eq!(next_id([1u64, 5, 3].into_iter()), 6);
        assert_eq!(next_id(std::iter::empty()), 1);
    }
}
