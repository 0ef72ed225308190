//! Agent bootstrapper: turns a bare node into a managed one over SSH.
//!
//! The sequence is service user, optional toolchain install, then the
//! agent binary itself. Every step writes an audit entry; the first
//! failure stops the run with an error-level entry and reverts
//! nothing, so the operator can rerun after fixing the node.

use crate::audit::{AuditLog, Level};
use crate::keys::IdentityStore;
use crate::ssh::{split_host_port, SshSession};
use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const SERVICE_USER: &str = "anyadmin";
const AGENT_BINARY: &str = "anyops-agent";
const REMOTE_BIN_DIR: &str = "/home/anyadmin/bin";
const REMOTE_LOG_DIR: &str = "/home/anyadmin/logs";
const REMOTE_TARBALL: &str = "/tmp/go.tar.gz";
const AUDIT_ACTION: &str = "Agent Deployment";

#[derive(Clone)]
pub struct Bootstrapper {
    ids: IdentityStore,
    audit: AuditLog,
    /// Local directory holding the agent binary and the toolchain
    /// tarball shipped to new nodes.
    assets_dir: PathBuf,
}

impl Bootstrapper {
    pub fn new(ids: IdentityStore, audit: AuditLog, assets_dir: PathBuf) -> Self {
        Self {
            ids,
            audit,
            assets_dir,
        }
    }

    /// Full deployment onto one node. Never returns an error to the
    /// HTTP layer; outcomes land in the audit trail.
    pub async fn deploy_agent(
        &self,
        operator: &str,
        node_ip: &str,
        mgmt_host: &str,
        mgmt_port: &str,
        mode: &str,
    ) {
        self.audit.record(
            operator,
            AUDIT_ACTION,
            &format!("Starting deployment to {node_ip} (Mode: {mode})"),
            Level::Info,
        );

        let (host, port) = split_host_port(node_ip);
        let session = match self.connect(&host, port).await {
            Ok(s) => s,
            Err(err) => {
                self.audit.record(
                    operator,
                    AUDIT_ACTION,
                    &format!("SSH connection failed to {node_ip}: {err}"),
                    Level::Error,
                );
                return;
            }
        };

        let step = |name: &str| {
            self.audit.record(operator, AUDIT_ACTION, name, Level::Info);
        };
        let fail = |name: &str, err: &anyhow::Error| {
            self.audit.record(
                operator,
                AUDIT_ACTION,
                &format!("{name} failed on {node_ip}: {err:#}"),
                Level::Error,
            );
        };

        step("Ensuring service user exists");
        if let Err(err) = self.ensure_user(&session).await {
            fail("Ensuring service user", &err);
            return;
        }

        if mode == "new_deployment" {
            step("Installing toolchain");
            if let Err(err) = self.install_toolchain(&session).await {
                fail("Installing toolchain", &err);
                return;
            }
        } else {
            info!(node_ip, "skipping toolchain install (integrate existing)");
        }

        step("Deploying agent");
        if let Err(err) = self
            .deploy_and_run(&session, &host, mgmt_host, mgmt_port)
            .await
        {
            fail("Deploying agent", &err);
            return;
        }

        self.audit.record(
            operator,
            AUDIT_ACTION,
            &format!("Agent deployment completed for {node_ip}"),
            Level::Info,
        );
    }

    async fn connect(&self, host: &str, port: u16) -> Result<SshSession> {
        let keypair = self.ids.ssh_keypair()?;
        Ok(SshSession::dial(host, port, "root", keypair).await?)
    }

    /// Creates the service user with docker and passwordless sudo
    /// access. Idempotent: an existing user is left untouched.
    async fn ensure_user(&self, session: &SshSession) -> Result<()> {
        if session.run(&format!("id -u {SERVICE_USER}")).await.is_ok() {
            return Ok(());
        }
        session
            .run(&format!(
                "useradd -m -s /bin/bash -G sudo,docker {SERVICE_USER} \
                 || (usermod -aG sudo {SERVICE_USER} && usermod -aG docker {SERVICE_USER})"
            ))
            .await
            .context("creating service user")?;
        session
            .run(&format!(
                "echo '{SERVICE_USER} ALL=(ALL) NOPASSWD:ALL' | tee /etc/sudoers.d/{SERVICE_USER}"
            ))
            .await
            .context("configuring sudoers")?;
        Ok(())
    }

    /// Ships the toolchain tarball, verifies it remotely against the
    /// locally computed digest, and unpacks it. A digest mismatch is
    /// fatal and reverts nothing beyond the tarball itself.
    async fn install_toolchain(&self, session: &SshSession) -> Result<()> {
        let local_tar = self.assets_dir.join("go.tar.gz");
        let local_digest = sha256_file(&local_tar)
            .with_context(|| format!("hashing {}", local_tar.display()))?;

        session
            .copy(&local_tar, REMOTE_TARBALL)
            .await
            .context("transferring toolchain tarball")?;

        let remote_out = session
            .run(&format!("sha256sum {REMOTE_TARBALL}"))
            .await
            .context("computing remote digest")?;
        let remote_digest = remote_out
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("sha256sum returned empty output"))?;
        if !remote_digest.eq_ignore_ascii_case(&local_digest) {
            session.run(&format!("rm -f {REMOTE_TARBALL}")).await.ok();
            bail!("toolchain checksum mismatch: local {local_digest} != remote {remote_digest}");
        }

        session
            .run(&format!(
                "rm -rf /usr/local/go && tar -C /usr/local -xzf {REMOTE_TARBALL} \
                 && rm -f {REMOTE_TARBALL}"
            ))
            .await
            .context("extracting toolchain")?;
        session
            .run(
                "echo 'export PATH=$PATH:/usr/local/go/bin' > /etc/profile.d/go.sh \
                 && chmod +x /etc/profile.d/go.sh",
            )
            .await
            .context("updating PATH")?;
        Ok(())
    }

    /// Uploads the agent binary and its config, replaces any running
    /// instance, and verifies the new process came up.
    async fn deploy_and_run(
        &self,
        session: &SshSession,
        node_ip: &str,
        mgmt_host: &str,
        mgmt_port: &str,
    ) -> Result<()> {
        session
            .run(&format!(
                "mkdir -p {REMOTE_BIN_DIR} {REMOTE_LOG_DIR} \
                 && chown -R {SERVICE_USER}:{SERVICE_USER} /home/{SERVICE_USER} \
                 && chmod 755 {REMOTE_LOG_DIR}"
            ))
            .await
            .context("preparing directories")?;

        // Stop the old agent first or the binary upload hits
        // "Text file busy".
        session
            .run(&format!("pkill -f {AGENT_BINARY} || true"))
            .await
            .ok();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let remote_bin = format!("{REMOTE_BIN_DIR}/{AGENT_BINARY}");
        session
            .copy(&self.assets_dir.join(AGENT_BINARY), &remote_bin)
            .await
            .context("uploading agent binary")?;

        let config = serde_json::json!({
            "mgmt_host": mgmt_host,
            "mgmt_port": mgmt_port.parse::<u16>().unwrap_or(8080),
            "node_ip": node_ip,
            "deployment_time": crate::models::now_rfc3339(),
        });
        let local_config =
            std::env::temp_dir().join(format!("config_{}.json", node_ip.replace('.', "_")));
        std::fs::write(&local_config, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("writing {}", local_config.display()))?;
        let copied = session
            .copy(&local_config, &format!("{REMOTE_BIN_DIR}/config.json"))
            .await;
        std::fs::remove_file(&local_config).ok();
        copied.context("uploading agent config")?;

        session
            .run(&format!(
                "chmod +x {remote_bin} && chown -R {SERVICE_USER}:{SERVICE_USER} {REMOTE_BIN_DIR}"
            ))
            .await
            .context("setting permissions")?;

        // stdin from /dev/null keeps nohup-over-ssh from hanging.
        session
            .run(&format!(
                "runuser -l {SERVICE_USER} -c 'cd {REMOTE_BIN_DIR} && \
                 (nohup {remote_bin} --config config.json \
                 --server http://{mgmt_host}:{mgmt_port} --ip {node_ip} \
                 > {REMOTE_LOG_DIR}/agent.log 2>&1 < /dev/null &) >/dev/null 2>&1'"
            ))
            .await
            .context("starting agent")?;

        tokio::time::sleep(Duration::from_secs(2)).await;
        let count_out = session
            .run(&format!(
                "ps ax | grep {AGENT_BINARY} | grep -v grep | wc -l"
            ))
            .await
            .context("checking agent process")?;
        if count_out.trim().parse::<u32>().unwrap_or(0) == 0 {
            let tail = session
                .run(&format!("tail -n 20 {REMOTE_LOG_DIR}/agent.log"))
                .await
                .unwrap_or_default();
            bail!("agent failed to start or died immediately. Log tail:\n{tail}");
        }
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let contents = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&contents)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"dummy content").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "bf0ecbdb9b814248d086c9b69cf26182d9d4138f2ad3d0637c4555fc8cbf68e5"
        );
    }
}
