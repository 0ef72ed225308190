//! Remote executor: SSH sessions onto managed nodes.
//!
//! Authentication tries the server's identity key first and falls back
//! to the fleet's provisioning password. Host keys are not verified;
//! targets are operator-supplied addresses on the management network.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_keys::key::{KeyPair, PublicKey};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_ATTEMPTS: u32 = 3;
const DIAL_BACKOFF: Duration = Duration::from_secs(1);
const FALLBACK_PASSWORD: &str = "password";

#[derive(Debug, Error)]
pub enum SshError {
    #[error("authentication rejected for {user}@{addr}: key not authorized")]
    Auth { user: String, addr: String },
    #[error("failed to dial {addr} after {DIAL_ATTEMPTS} attempts: {source}")]
    Dial {
        addr: String,
        #[source]
        source: russh::Error,
    },
    #[error("session error on {addr}: {source}")]
    Session {
        addr: String,
        #[source]
        source: russh::Error,
    },
    #[error("command exited with status {status}: {output}")]
    Exec { status: u32, output: String },
    #[error("reading local file {path}: {source}")]
    LocalRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

struct AcceptAllHost;

#[async_trait::async_trait]
impl client::Handler for AcceptAllHost {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshSession {
    handle: Handle<AcceptAllHost>,
    addr: String,
}

impl SshSession {
    /// Dials and authenticates as `user`. Transient dial failures are
    /// retried; an authenticated-but-rejected key is not.
    pub async fn dial(
        host: &str,
        port: u16,
        user: &str,
        keypair: KeyPair,
    ) -> Result<Self, SshError> {
        let addr = format!("{host}:{port}");
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut last_err = russh::Error::Disconnect;
        for attempt in 1..=DIAL_ATTEMPTS {
            let connect = client::connect(config.clone(), (host, port), AcceptAllHost);
            match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
                Ok(Ok(handle)) => {
                    let mut session = Self {
                        handle,
                        addr: addr.clone(),
                    };
                    session.authenticate(user, keypair).await?;
                    return Ok(session);
                }
                Ok(Err(err)) => {
                    warn!(%addr, attempt, %err, "SSH dial failed");
                    last_err = err;
                }
                Err(_) => {
                    warn!(%addr, attempt, "SSH dial timed out");
                    last_err = russh::Error::ConnectionTimeout;
                }
            }
            if attempt < DIAL_ATTEMPTS {
                tokio::time::sleep(DIAL_BACKOFF).await;
            }
        }
        Err(SshError::Dial {
            addr,
            source: last_err,
        })
    }

    async fn authenticate(&mut self, user: &str, keypair: KeyPair) -> Result<(), SshError> {
        let by_key = self
            .handle
            .authenticate_publickey(user, Arc::new(keypair))
            .await
            .map_err(|source| SshError::Session {
                addr: self.addr.clone(),
                source,
            })?;
        if by_key {
            debug!(addr = %self.addr, user, "authenticated with identity key");
            return Ok(());
        }

        let by_password = self
            .handle
            .authenticate_password(user, FALLBACK_PASSWORD)
            .await
            .map_err(|source| SshError::Session {
                addr: self.addr.clone(),
                source,
            })?;
        if by_password {
            debug!(addr = %self.addr, user, "authenticated with fallback password");
            return Ok(());
        }
        Err(SshError::Auth {
            user: user.to_string(),
            addr: self.addr.clone(),
        })
    }

    /// Runs a command, returning combined stdout+stderr. A non-zero
    /// exit status carries the same combined output in the error.
    pub async fn run(&self, command: &str) -> Result<String, SshError> {
        let mut channel =
            self.handle
                .channel_open_session()
                .await
                .map_err(|source| SshError::Session {
                    addr: self.addr.clone(),
                    source,
                })?;
        channel
            .exec(true, command)
            .await
            .map_err(|source| SshError::Session {
                addr: self.addr.clone(),
                source,
            })?;

        let mut output = Vec::new();
        let mut status = 0u32;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status,
                _ => {}
            }
        }

        let output = String::from_utf8_lossy(&output).into_owned();
        if status != 0 {
            return Err(SshError::Exec { status, output });
        }
        Ok(output)
    }

    /// Streams a local file to `remote_path` through a base64 pipe, so
    /// no scp/sftp subsystem is required on the target. Mode and owner
    /// are left to follow-up chmod/chown commands.
    pub async fn copy(&self, local_path: &Path, remote_path: &str) -> Result<(), SshError> {
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|source| SshError::LocalRead {
                path: local_path.display().to_string(),
                source,
            })?;
        let encoded = BASE64.encode(&contents);

        let remote_dir = remote_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .filter(|d| !d.is_empty())
            .unwrap_or(".");
        let command = format!("mkdir -p {remote_dir} && base64 -d > {remote_path}");

        let mut channel =
            self.handle
                .channel_open_session()
                .await
                .map_err(|source| SshError::Session {
                    addr: self.addr.clone(),
                    source,
                })?;
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|source| SshError::Session {
                addr: self.addr.clone(),
                source,
            })?;
        channel
            .data(encoded.as_bytes())
            .await
            .map_err(|source| SshError::Session {
                addr: self.addr.clone(),
                source,
            })?;
        channel.eof().await.map_err(|source| SshError::Session {
            addr: self.addr.clone(),
            source,
        })?;

        let mut status = 0u32;
        let mut output = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status,
                _ => {}
            }
        }
        if status != 0 {
            return Err(SshError::Exec {
                status,
                output: String::from_utf8_lossy(&output).into_owned(),
            });
        }
        Ok(())
    }

    /// Cheap liveness check: dial plus a trivial remote command.
    pub async fn check(host: &str, port: u16, keypair: KeyPair) -> Result<(), SshError> {
        let session = Self::dial(host, port, "root", keypair).await?;
        session.run("echo hello").await?;
        Ok(())
    }
}

/// Splits `host[:port]`, defaulting to 22.
pub fn split_host_port(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (target.to_string(), 22),
        },
        None => (target.to_string(), 22),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("10.0.0.1"), ("10.0.0.1".to_string(), 22));
        assert_eq!(
            split_host_port("10.0.0.1:2222"),
            ("10.0.0.1".to_string(), 2222)
        );
        // A trailing colon with garbage falls back to the default port.
        assert_eq!(
            split_host_port("10.0.0.1:ssh"),
            ("10.0.0.1:ssh".to_string(), 22)
        );
    }

    #[test]
    fn exec_error_carries_output() {
        let err = SshError::Exec {
            status: 127,
            output: "bash: nope: command not found".to_string(),
        };
        assert!(err.to_string().contains("command not found"));
        assert!(err.to_string().contains("127"));
    }
}
