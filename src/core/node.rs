//! One virtual machine: identity, artifacts, lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::domain_xml::{extract_mac_addresses, DomainSpec};
use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::hypervisor::{DomainHandle, HypervisorConnection, VirtualNetwork};
use crate::core::retry::{wait_for, RetryError, RetryPolicy};
use crate::core::ssh::{SshProbe, SshProbeError};
use crate::core::volumes::VolumeProvisioner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Unbooted,
    Booting,
    Running,
    Destroyed,
    Failed,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodePhase::Unbooted => "unbooted",
            NodePhase::Booting => "booting",
            NodePhase::Running => "running",
            NodePhase::Destroyed => "destroyed",
            NodePhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Polling intervals and deadlines for the two readiness waits.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub lease: Duration,
    pub ssh: Duration,
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(45),
            ssh: Duration::from_secs(60),
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// Per-pool node parameters, shared by every boot task.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub golden_image: PathBuf,
    pub memory_kib: u64,
    pub disk_size_gib: u32,
    pub ssh_public_key: String,
    pub timeouts: Timeouts,
    pub provisioner: VolumeProvisioner,
}

/// Serializable snapshot of a node for reports.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub role: NodeRole,
    pub tags: Vec<String>,
    pub phase: NodePhase,
    pub ips: Vec<String>,
}

enum LeaseProbe {
    NoLease,
    Hypervisor(ProvisionError),
}

pub struct Node {
    name: String,
    role: NodeRole,
    tags: Vec<String>,
    opts: NodeOptions,
    snapshot_path: PathBuf,
    seed_path: PathBuf,
    conn: Box<dyn HypervisorConnection>,
    network: Arc<dyn VirtualNetwork>,
    probe: Arc<dyn SshProbe>,
    cancel: CancellationToken,
    domain: Option<Box<dyn DomainHandle>>,
    phase: NodePhase,
    ips: Vec<String>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        role: NodeRole,
        tags: Vec<String>,
        conn: Box<dyn HypervisorConnection>,
        network: Arc<dyn VirtualNetwork>,
        probe: Arc<dyn SshProbe>,
        opts: NodeOptions,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        // Artifacts live next to the golden image, named after the node,
        // so reruns for the same name overwrite rather than accumulate.
        let artifact_dir = opts
            .golden_image
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let snapshot_path = artifact_dir.join(format!("{name}-snapshot.qcow2"));
        let seed_path = artifact_dir.join(format!("{name}-cloud-init-seed.img"));
        Self {
            name,
            role,
            tags,
            opts,
            snapshot_path,
            seed_path,
            conn,
            network,
            probe,
            cancel,
            domain: None,
            phase: NodePhase::Unbooted,
            ips: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn phase(&self) -> NodePhase {
        self.phase
    }

    /// Discovered addresses; empty until boot completes lease discovery.
    pub fn ips(&self) -> &[String] {
        &self.ips
    }

    /// The address used for ssh, once discovered.
    pub fn ssh_ip(&self) -> Option<&str> {
        self.ips.first().map(String::as_str)
    }

    pub fn snapshot_path(&self) -> &std::path::Path {
        &self.snapshot_path
    }

    pub fn seed_path(&self) -> &std::path::Path {
        &self.seed_path
    }

    pub fn report(&self) -> NodeReport {
        NodeReport {
            name: self.name.clone(),
            role: self.role,
            tags: self.tags.clone(),
            phase: self.phase,
            ips: self.ips.clone(),
        }
    }

    /// Provision artifacts, define and start the domain, then wait until
    /// the guest has an address and accepts ssh. Any failing step aborts
    /// the sequence and leaves the node in `Failed`.
    pub async fn boot(&mut self) -> ProvisionResult<()> {
        if self.phase != NodePhase::Unbooted {
            return Err(ProvisionError::InvalidState {
                node: self.name.clone(),
                operation: "boot",
                phase: self.phase.to_string(),
            });
        }
        self.phase = NodePhase::Booting;
        match self.boot_sequence().await {
            Ok(()) => {
                self.phase = NodePhase::Running;
                info!(node = %self.name, ip = ?self.ssh_ip(), "node is ready");
                Ok(())
            }
            Err(e) => {
                self.phase = NodePhase::Failed;
                error!(node = %self.name, error = %e, "boot failed");
                Err(e)
            }
        }
    }

    async fn boot_sequence(&mut self) -> ProvisionResult<()> {
        self.opts
            .provisioner
            .create_backing_disk(
                &self.opts.golden_image,
                &self.snapshot_path,
                self.opts.disk_size_gib,
            )
            .await?;
        self.opts
            .provisioner
            .create_cloud_init_seed(&self.seed_path, &self.opts.ssh_public_key, &self.name)
            .await?;

        let spec = DomainSpec {
            name: self.name.clone(),
            memory_kib: self.opts.memory_kib,
            disk_path: self.snapshot_path.clone(),
            seed_path: self.seed_path.clone(),
            network: self.network.name().to_string(),
        };
        let xml = spec.to_xml();
        info!(node = %self.name, image = %self.snapshot_path.display(), "booting");
        debug!(node = %self.name, %xml, "domain XML");

        let domain = self.conn.define_domain(&xml).await?;
        domain.start().await?;

        self.ips = self.discover_ips(domain.as_ref()).await?;
        self.domain = Some(domain);

        self.wait_for_ssh().await
    }

    /// Stop and undefine the domain. Only valid after a successful boot.
    pub async fn destroy(&mut self) -> ProvisionResult<()> {
        if self.phase != NodePhase::Running || self.domain.is_none() {
            return Err(ProvisionError::InvalidState {
                node: self.name.clone(),
                operation: "destroy",
                phase: self.phase.to_string(),
            });
        }
        if let Some(domain) = self.domain.as_ref() {
            domain.stop().await?;
            domain.undefine().await?;
        }
        self.domain = None;
        self.phase = NodePhase::Destroyed;
        info!(node = %self.name, "destroyed");
        Ok(())
    }

    /// Poll the network's lease table until one of the domain's MACs has
    /// an address.
    async fn discover_ips(&self, domain: &dyn DomainHandle) -> ProvisionResult<Vec<String>> {
        let xml = domain.xml_desc().await?;
        let macs = extract_mac_addresses(&xml);
        if macs.is_empty() {
            return Err(ProvisionError::Hypervisor(format!(
                "domain {} reports no network interface",
                self.name
            )));
        }
        let timeouts = self.opts.timeouts;
        info!(
            node = %self.name,
            "waiting up to {}s for a DHCP lease",
            timeouts.lease.as_secs()
        );
        let policy = RetryPolicy {
            interval: timeouts.poll_interval,
            deadline: timeouts.lease,
        };
        let network = Arc::clone(&self.network);
        let result = wait_for(
            policy,
            &self.cancel,
            |e| matches!(e, LeaseProbe::NoLease),
            || {
                let network = Arc::clone(&network);
                let macs = macs.clone();
                async move {
                    let leases = network.dhcp_leases().await.map_err(LeaseProbe::Hypervisor)?;
                    let ips: Vec<String> = leases
                        .iter()
                        .filter(|l| macs.iter().any(|m| m.eq_ignore_ascii_case(&l.mac)))
                        .map(|l| l.ipaddr.clone())
                        .collect();
                    if ips.is_empty() {
                        Err(LeaseProbe::NoLease)
                    } else {
                        Ok(ips)
                    }
                }
            },
        )
        .await;

        match result {
            Ok(ips) => {
                info!(node = %self.name, ?ips, "found IP addresses");
                Ok(ips)
            }
            Err(RetryError::Timeout { waited, .. }) => Err(ProvisionError::LeaseTimeout {
                node: self.name.clone(),
                waited,
            }),
            Err(RetryError::Fatal(LeaseProbe::Hypervisor(e))) => Err(e),
            Err(RetryError::Fatal(LeaseProbe::NoLease)) => Err(ProvisionError::LeaseTimeout {
                node: self.name.clone(),
                waited: Duration::ZERO,
            }),
            Err(RetryError::Cancelled) => Err(ProvisionError::Cancelled),
        }
    }

    /// Poll an ssh handshake against the first discovered address.
    async fn wait_for_ssh(&self) -> ProvisionResult<()> {
        let ip = self.ips.first().cloned().ok_or_else(|| {
            ProvisionError::Hypervisor(format!("node {}: no address to probe", self.name))
        })?;
        let timeouts = self.opts.timeouts;
        info!(
            node = %self.name,
            %ip,
            "waiting up to {}s for ssh",
            timeouts.ssh.as_secs()
        );
        let policy = RetryPolicy {
            interval: timeouts.poll_interval,
            deadline: timeouts.ssh,
        };
        let probe = Arc::clone(&self.probe);
        let result = wait_for(
            policy,
            &self.cancel,
            |e| matches!(e, SshProbeError::NotReady(_)),
            || {
                let probe = Arc::clone(&probe);
                let ip = ip.clone();
                async move { probe.probe(&ip).await }
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(node = %self.name, %ip, "ssh ready");
                Ok(())
            }
            Err(RetryError::Timeout { waited, .. }) => Err(ProvisionError::SshTimeout {
                node: self.name.clone(),
                ip,
                waited,
            }),
            Err(RetryError::Fatal(SshProbeError::Fatal(e))) => Err(e),
            Err(RetryError::Fatal(SshProbeError::NotReady(_))) => Err(ProvisionError::SshTimeout {
                node: self.name.clone(),
                ip,
                waited: Duration::ZERO,
            }),
            Err(RetryError::Cancelled) => Err(ProvisionError::Cancelled),
        }
    }
}
