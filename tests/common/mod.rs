#![allow(dead_code)]

// Shared fakes for the hypervisor boundary, plus stub external tools.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use testbed_vm_manager::{
    ConnectionFactory, DhcpLease, DomainHandle, HypervisorConnection, Node, NodeOptions, NodeRole,
    ProvisionError, ProvisionResult, SshProbe, SshProbeError, Timeouts, VirtualNetwork,
    VolumeProvisioner,
};

/// Shared state behind all fake connections of one test.
pub struct FakeWorld {
    pub network_name: String,
    pub auto_lease_on_start: bool,
    pub leases: Mutex<Vec<DhcpLease>>,
    /// Lease reads that return an empty table before leases appear.
    pub lease_delay_polls: AtomicUsize,
    pub macs: Mutex<HashMap<String, String>>,
    pub defined: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub undefined: Mutex<Vec<String>>,
    pub connections: AtomicUsize,
    mac_seq: AtomicUsize,
}

impl FakeWorld {
    pub fn new(network_name: &str, auto_lease_on_start: bool) -> Arc<Self> {
        Arc::new(Self {
            network_name: network_name.to_string(),
            auto_lease_on_start,
            leases: Mutex::new(Vec::new()),
            lease_delay_polls: AtomicUsize::new(0),
            macs: Mutex::new(HashMap::new()),
            defined: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            undefined: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            mac_seq: AtomicUsize::new(0),
        })
    }

    pub fn add_lease(&self, mac: &str, ipaddr: &str) {
        self.leases.lock().unwrap().push(DhcpLease {
            mac: mac.to_string(),
            ipaddr: ipaddr.to_string(),
        });
    }

    pub fn delay_leases(&self, polls: usize) {
        self.lease_delay_polls.store(polls, Ordering::SeqCst);
    }

    /// MAC the fake hypervisor will hand to the next defined domain.
    pub fn next_mac(&self) -> String {
        format!("52:54:00:ab:cd:{:02x}", self.mac_seq.load(Ordering::SeqCst))
    }
}

pub struct FakeFactory {
    world: Arc<FakeWorld>,
}

impl FakeFactory {
    pub fn new(world: &Arc<FakeWorld>) -> Arc<Self> {
        Arc::new(Self {
            world: Arc::clone(world),
        })
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(&self) -> ProvisionResult<Box<dyn HypervisorConnection>> {
        self.world.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            world: Arc::clone(&self.world),
        }))
    }
}

pub struct FakeConnection {
    world: Arc<FakeWorld>,
}

impl FakeConnection {
    pub fn new(world: &Arc<FakeWorld>) -> Box<Self> {
        world.connections.fetch_add(1, Ordering::SeqCst);
        Box::new(Self {
            world: Arc::clone(world),
        })
    }
}

#[async_trait]
impl HypervisorConnection for FakeConnection {
    async fn define_domain(&self, xml: &str) -> ProvisionResult<Box<dyn DomainHandle>> {
        let name = xml
            .split("<name>")
            .nth(1)
            .and_then(|s| s.split("</name>").next())
            .unwrap_or("unknown")
            .to_string();
        let seq = self.world.mac_seq.fetch_add(1, Ordering::SeqCst);
        let mac = format!("52:54:00:ab:cd:{seq:02x}");
        let ipaddr = format!("192.168.122.{}", 10 + seq);
        self.world
            .macs
            .lock()
            .unwrap()
            .insert(name.clone(), mac.clone());
        self.world.defined.lock().unwrap().push(name.clone());
        Ok(Box::new(FakeDomain {
            world: Arc::clone(&self.world),
            name,
            mac,
            ipaddr,
        }))
    }

    async fn network_by_name(&self, name: &str) -> ProvisionResult<Arc<dyn VirtualNetwork>> {
        if name != self.world.network_name {
            return Err(ProvisionError::NetworkNotFound {
                name: name.to_string(),
            });
        }
        Ok(Arc::new(FakeNetwork {
            world: Arc::clone(&self.world),
        }))
    }
}

pub struct FakeDomain {
    world: Arc<FakeWorld>,
    pub name: String,
    pub mac: String,
    pub ipaddr: String,
}

#[async_trait]
impl DomainHandle for FakeDomain {
    async fn start(&self) -> ProvisionResult<()> {
        self.world.started.lock().unwrap().push(self.name.clone());
        if self.world.auto_lease_on_start {
            self.world.add_lease(&self.mac, &self.ipaddr);
        }
        Ok(())
    }

    async fn stop(&self) -> ProvisionResult<()> {
        self.world.stopped.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn undefine(&self) -> ProvisionResult<()> {
        self.world.undefined.lock().unwrap().push(self.name.clone());
        Ok(())
    }

    async fn xml_desc(&self) -> ProvisionResult<String> {
        Ok(format!(
            "<domain type='kvm'><name>{}</name><devices>\
             <interface type='network'><mac address='{}'/></interface>\
             </devices></domain>",
            self.name, self.mac
        ))
    }
}

pub struct FakeNetwork {
    world: Arc<FakeWorld>,
}

impl FakeNetwork {
    pub fn shared(world: &Arc<FakeWorld>) -> Arc<dyn VirtualNetwork> {
        Arc::new(Self {
            world: Arc::clone(world),
        })
    }
}

#[async_trait]
impl VirtualNetwork for FakeNetwork {
    fn name(&self) -> &str {
        &self.world.network_name
    }

    async fn dhcp_leases(&self) -> ProvisionResult<Vec<DhcpLease>> {
        let delayed = self
            .world
            .lease_delay_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if delayed {
            return Ok(Vec::new());
        }
        Ok(self.world.leases.lock().unwrap().clone())
    }
}

/// Probe that fails `failures` times, then succeeds forever.
pub struct FlakyProbe {
    remaining: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakyProbe {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshProbe for FlakyProbe {
    async fn probe(&self, _ip: &str) -> Result<(), SshProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(SshProbeError::NotReady("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

pub fn ready_probe() -> Arc<FlakyProbe> {
    FlakyProbe::new(0)
}

pub fn never_ready_probe() -> Arc<FlakyProbe> {
    FlakyProbe::new(usize::MAX)
}

/// Write stub `qemu-img` and ISO tools into `dir`. The qemu stub fails
/// for any destination containing `fail_marker`; the ISO stub copies the
/// seed input files into the output so tests can inspect them.
pub fn write_stub_tools(dir: &Path, fail_marker: Option<&str>) -> (String, String) {
    let qemu = dir.join("qemu-img-stub");
    let fail_case = match fail_marker {
        Some(marker) => format!(
            "case \"$dest\" in\n  *{marker}*) echo \"stub failure\" >&2; exit 1 ;;\nesac\n"
        ),
        None => String::new(),
    };
    write_executable(
        &qemu,
        &format!(
            "#!/bin/sh\nprev=\"\"\ndest=\"\"\nfor a in \"$@\"; do dest=\"$prev\"; prev=\"$a\"; done\n{fail_case}: > \"$dest\"\n"
        ),
    );

    let iso = dir.join("mkisofs-stub");
    write_executable(
        &iso,
        "#!/bin/sh\nout=\"\"\ndir=\"\"\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"-output\" ]; then out=\"$2\"; shift; fi\n  dir=\"$1\"\n  shift\ndone\n[ -f \"$dir/user-data\" ] || exit 3\n[ -f \"$dir/meta-data\" ] || exit 3\ncat \"$dir/user-data\" \"$dir/meta-data\" > \"$out\"\n",
    );

    (
        qemu.to_string_lossy().into_owned(),
        iso.to_string_lossy().into_owned(),
    )
}

pub fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Node options wired to stub tools under `tool_dir`, artifacts rooted in
/// the same directory.
pub fn stub_options(tool_dir: &Path, fail_marker: Option<&str>) -> NodeOptions {
    let (qemu, iso) = write_stub_tools(tool_dir, fail_marker);
    NodeOptions {
        golden_image: tool_dir.join("golden.qcow2"),
        memory_kib: 4 * 1024 * 1024,
        disk_size_gib: 10,
        ssh_public_key: "ssh-ed25519 AAAATESTKEY test@host".to_string(),
        timeouts: Timeouts::default(),
        provisioner: VolumeProvisioner::with_tools(qemu, vec![iso]),
    }
}

/// A node wired entirely to fakes.
pub fn make_node(
    world: &Arc<FakeWorld>,
    name: &str,
    probe: Arc<dyn SshProbe>,
    opts: NodeOptions,
    cancel: CancellationToken,
) -> Node {
    Node::new(
        name,
        NodeRole::Master,
        vec!["master".to_string()],
        FakeConnection::new(world),
        FakeNetwork::shared(world),
        probe,
        opts,
        cancel,
    )
}

pub fn artifact_count(dir: &Path, name: &str) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(name))
        .count()
}

pub fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

pub fn unique_name(prefix: &str) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{prefix}-{}", rng.gen::<u32>())
}
