//! Disk and cloud-init seed provisioning.
//!
//! Both artifacts are produced by external tools. Artifact paths are
//! derived from the node name, and any stale file is deleted first, so a
//! rerun for the same name always leaves exactly one fresh file.

use std::path::Path;
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::errors::{ProvisionError, ProvisionResult};

/// Invokes `qemu-img` and an ISO authoring tool. Binary names are
/// injectable so tests can point them at stub scripts.
#[derive(Debug, Clone)]
pub struct VolumeProvisioner {
    qemu_img: String,
    iso_tools: Vec<String>,
}

impl Default for VolumeProvisioner {
    fn default() -> Self {
        Self {
            qemu_img: "qemu-img".to_string(),
            iso_tools: vec!["mkisofs".to_string(), "genisoimage".to_string()],
        }
    }
}

impl VolumeProvisioner {
    pub fn with_tools(qemu_img: impl Into<String>, iso_tools: Vec<String>) -> Self {
        Self {
            qemu_img: qemu_img.into(),
            iso_tools,
        }
    }

    /// Create a copy-on-write qcow2 snapshot at `dest`, backed by the
    /// golden image.
    pub async fn create_backing_disk(
        &self,
        golden: &Path,
        dest: &Path,
        size_gib: u32,
    ) -> ProvisionResult<()> {
        remove_stale(dest).await?;

        let backing = format!("backing_file={}", golden.display());
        let output = Command::new(&self.qemu_img)
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-o"])
            .arg(&backing)
            .arg(dest)
            .arg(format!("{size_gib}G"))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| tool_spawn_error(&self.qemu_img, e))?;

        check_status(&self.qemu_img, &output)?;
        info!(dest = %dest.display(), "created qcow2 backing file");
        Ok(())
    }

    /// Build the cloud-init seed volume at `dest`, carrying the authorized
    /// key and the instance identity. The scratch directory holding
    /// `user-data` and `meta-data` is removed on every exit path.
    pub async fn create_cloud_init_seed(
        &self,
        dest: &Path,
        public_key: &str,
        instance_name: &str,
    ) -> ProvisionResult<()> {
        // Tool absence is its own failure mode, checked before any work.
        let iso_tool = self.locate_iso_tool()?;

        remove_stale(dest).await?;

        let scratch = TempDir::new()?;
        let user_data = format!(
            "#cloud-config\ndebug: True\nssh_authorized_keys:\n  - {}\n",
            public_key.trim()
        );
        let meta_data = format!(
            "---\ninstance-id: {}\nlocal-hostname: {}\n",
            Uuid::new_v4(),
            instance_name
        );
        tokio::fs::write(scratch.path().join("user-data"), user_data).await?;
        tokio::fs::write(scratch.path().join("meta-data"), meta_data).await?;

        let output = Command::new(&iso_tool)
            .arg("-output")
            .arg(dest)
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(scratch.path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| tool_spawn_error(&iso_tool, e))?;

        check_status(&iso_tool, &output)?;
        info!(dest = %dest.display(), instance = instance_name, "created cloud-init seed");
        Ok(())
    }

    fn locate_iso_tool(&self) -> ProvisionResult<String> {
        for candidate in &self.iso_tools {
            if which::which(candidate).is_ok() {
                return Ok(candidate.clone());
            }
        }
        Err(ProvisionError::ToolMissing {
            tool: self
                .iso_tools
                .first()
                .cloned()
                .unwrap_or_else(|| "mkisofs".to_string()),
        })
    }
}

async fn remove_stale(path: &Path) -> ProvisionResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "deleted stale artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn tool_spawn_error(tool: &str, err: std::io::Error) -> ProvisionError {
    match err.kind() {
        std::io::ErrorKind::NotFound => ProvisionError::ToolMissing {
            tool: tool.to_string(),
        },
        _ => ProvisionError::Io(err),
    }
}

fn check_status(tool: &str, output: &std::process::Output) -> ProvisionResult<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(ProvisionError::ToolFailed {
        tool: tool.to_string(),
        status: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
