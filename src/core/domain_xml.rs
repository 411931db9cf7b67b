//! Domain XML rendering and inspection.
//!
//! Policy choices (vCPU count, CPU passthrough, device layout, lifecycle
//! actions) are fixed; only name, memory, disk paths and network vary.

use std::path::{Path, PathBuf};

/// Hardware description for one test VM.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub memory_kib: u64,
    pub disk_path: PathBuf,
    pub seed_path: PathBuf,
    pub network: String,
}

impl DomainSpec {
    /// Render the libvirt domain XML.
    ///
    /// All variable fields pass through [`xml_escape`], so a hostile node
    /// name cannot break out of its element.
    pub fn to_xml(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{memory}</memory>
  <currentMemory unit='KiB'>{memory}</currentMemory>
  <vcpu placement='static'>2</vcpu>
  <cpu mode='host-passthrough'/>
  <os>
    <type arch='x86_64' machine='pc-i440fx-2.1'>hvm</type>
    <boot dev='hd'/>
  </os>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <memballoon model='virtio'/>
  </devices>
</domain>
"#,
            name = xml_escape(&self.name),
            memory = self.memory_kib,
            disk = xml_escape(&path_str(&self.disk_path)),
            seed = xml_escape(&path_str(&self.seed_path)),
            network = xml_escape(&self.network),
        )
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Escape a value for use in XML text or a single-quoted attribute.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Pull every interface MAC address out of a domain XML description.
///
/// Matches `<mac address='..'/>` elements with either quote style. Only the
/// address values are needed, so this stays a scanner rather than a full
/// XML parse.
pub fn extract_mac_addresses(xml: &str) -> Vec<String> {
    let mut macs = Vec::new();
    let mut rest = xml;
    while let Some(pos) = rest.find("<mac") {
        rest = &rest[pos + 4..];
        let Some(end) = rest.find('>') else { break };
        let element = &rest[..end];
        if let Some(attr) = element.find("address=") {
            let after = &element[attr + "address=".len()..];
            if let Some(quote) = after.chars().next() {
                if quote == '\'' || quote == '"' {
                    if let Some(close) = after[1..].find(quote) {
                        macs.push(after[1..1 + close].to_string());
                    }
                }
            }
        }
        rest = &rest[end + 1..];
    }
    macs
}
