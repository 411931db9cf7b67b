use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::node::{NodeOptions, Timeouts};
use crate::core::volumes::VolumeProvisioner;

#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    pub libvirt: LibvirtSettings,
    pub ssh: SshSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LibvirtSettings {
    pub connection_uri: String,
    pub network: String,
    pub golden_image: PathBuf,
    pub memory_mb: u64,
    pub disk_size_gib: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SshSettings {
    pub user: String,
    pub public_key_path: PathBuf,
    pub private_key_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub lease_secs: u64,
    pub ssh_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            lease_secs: 45,
            ssh_secs: 60,
            poll_interval_secs: 3,
        }
    }
}

impl Settings {
    /// Layered load: `config/default.toml`, then an optional
    /// `config/local.toml`, then `APP_*` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("loading configuration from path: {}", config_path);

        let config = Config::builder()
            .set_default("libvirt.connection_uri", "qemu:///system")?
            .set_default("libvirt.memory_mb", 4096)?
            .set_default("libvirt.disk_size_gib", 10)?
            .set_default("ssh.user", "root")?
            .add_source(File::with_name(&format!("{}/default", config_path)))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path.to_path_buf()))
            .build()?;
        config.try_deserialize()
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            lease: Duration::from_secs(self.timeouts.lease_secs),
            ssh: Duration::from_secs(self.timeouts.ssh_secs),
            poll_interval: Duration::from_secs(self.timeouts.poll_interval_secs),
        }
    }

    /// Node parameters derived from this configuration. Reads the public
    /// key file so boot tasks never touch the filesystem for it again.
    pub fn node_options(&self) -> std::io::Result<NodeOptions> {
        let public_key = std::fs::read_to_string(&self.ssh.public_key_path)?;
        Ok(NodeOptions {
            golden_image: self.libvirt.golden_image.clone(),
            memory_kib: self.libvirt.memory_mb * 1024,
            disk_size_gib: self.libvirt.disk_size_gib,
            ssh_public_key: public_key.trim().to_string(),
            timeouts: self.timeouts(),
            provisioner: VolumeProvisioner::default(),
        })
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        libvirt: LibvirtSettings {
            connection_uri: "qemu:///system".to_string(),
            network: "default".to_string(),
            golden_image: PathBuf::from("/var/lib/libvirt/images/golden.qcow2"),
            memory_mb: 4096,
            disk_size_gib: 10,
        },
        ssh: SshSettings {
            user: "root".to_string(),
            public_key_path: PathBuf::from("~/.ssh/id_ed25519.pub"),
            private_key_path: PathBuf::from("~/.ssh/id_ed25519"),
        },
        timeouts: TimeoutSettings::default(),
    }
}
