//! Ssh readiness probing.
//!
//! A probe is a single key-authenticated handshake attempt; the node
//! decides how often to retry. The real implementation shells out to the
//! OpenSSH client, which folds host-key, authentication, transport and
//! socket failures into its exit status, matching the retry classes the
//! readiness wait needs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::core::errors::ProvisionError;

#[derive(Debug, Error)]
pub enum SshProbeError {
    /// The guest is not accepting authenticated connections yet; retry.
    #[error("ssh not ready: {0}")]
    NotReady(String),

    /// Failure unrelated to guest readiness; propagated immediately.
    #[error(transparent)]
    Fatal(#[from] ProvisionError),
}

#[async_trait]
pub trait SshProbe: Send + Sync {
    /// Attempt one handshake against `ip`. `Ok(())` means the shell
    /// daemon accepted the key.
    async fn probe(&self, ip: &str) -> Result<(), SshProbeError>;
}

/// Probes with the system `ssh` client in batch mode.
pub struct CommandSshProbe {
    user: String,
    private_key: PathBuf,
    connect_timeout: Duration,
}

impl CommandSshProbe {
    pub fn new(user: impl Into<String>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            private_key: private_key.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl SshProbe for CommandSshProbe {
    async fn probe(&self, ip: &str) -> Result<(), SshProbeError> {
        let output = Command::new("ssh")
            .arg("-i")
            .arg(&self.private_key)
            .arg("-l")
            .arg(&self.user)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg(ip)
            .arg("exit")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SshProbeError::Fatal(ProvisionError::ToolMissing {
                    tool: "ssh".to_string(),
                }),
                _ => SshProbeError::Fatal(ProvisionError::Io(e)),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr.lines().last().unwrap_or("connection failed").to_string();
        debug!(ip, %reason, "ssh probe attempt failed");
        Err(SshProbeError::NotReady(reason))
    }
}
