//! Libvirt domain XML generation.
//!
//! A [`DomainDef`] is the fully resolved device set for one session:
//! direct kernel boot from pool-backed volumes, virtio disks carrying
//! the spec's serials, virtio-net interfaces, 9p shares, and a serial
//! console bound to a host Unix socket. The XML is write-only; nothing
//! in this crate parses it back.

use std::fmt::Write;
use std::path::PathBuf;

use crate::spec::{DiskTransport, NetMode, NetSpec};

/// One disk attachment, already resolved to a host path.
#[derive(Debug, Clone)]
pub struct DiskDevice {
    pub path: PathBuf,
    /// Guest-visible serial (DiskSpec name, unchanged).
    pub serial: String,
    pub transport: DiskTransport,
    /// Guest device node (vda, sdb, ...).
    pub target: String,
}

/// One 9p directory share.
#[derive(Debug, Clone)]
pub struct ShareDevice {
    pub local: PathBuf,
    /// Mount tag the guest init uses.
    pub tag: String,
    /// Guest-side mount point.
    pub remote: String,
}

/// Fully resolved domain definition.
#[derive(Debug, Clone)]
pub struct DomainDef {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub cmdline: String,
    pub disks: Vec<DiskDevice>,
    pub nets: Vec<NetSpec>,
    pub shares: Vec<ShareDevice>,
    pub console_sock: Option<PathBuf>,
    /// QEMU gdb stub endpoint, `HOST:PORT`.
    pub gdb: Option<String>,
}

/// Render a [`DomainDef`] as libvirt domain XML.
pub fn domain_xml(def: &DomainDef) -> String {
    let mut x = String::with_capacity(2048);
    let _ = writeln!(
        x,
        "<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>"
    );
    let _ = writeln!(x, "  <name>{}</name>", esc(&def.name));
    let _ = writeln!(x, "  <memory unit='MiB'>{}</memory>", def.memory_mib);
    let _ = writeln!(x, "  <vcpu>{}</vcpu>", def.vcpus);
    let _ = writeln!(x, "  <os>");
    let _ = writeln!(x, "    <type arch='x86_64' machine='q35'>hvm</type>");
    let _ = writeln!(
        x,
        "    <kernel>{}</kernel>",
        esc(&def.kernel_path.to_string_lossy())
    );
    let _ = writeln!(
        x,
        "    <initrd>{}</initrd>",
        esc(&def.initrd_path.to_string_lossy())
    );
    let _ = writeln!(x, "    <cmdline>{}</cmdline>", esc(&def.cmdline));
    let _ = writeln!(x, "  </os>");
    let _ = writeln!(x, "  <features><acpi/></features>");
    // Crashed guests must stay observable for the kdump wait.
    let _ = writeln!(x, "  <on_poweroff>destroy</on_poweroff>");
    let _ = writeln!(x, "  <on_reboot>restart</on_reboot>");
    let _ = writeln!(x, "  <on_crash>preserve</on_crash>");
    let _ = writeln!(x, "  <devices>");

    let needs_scsi = def
        .disks
        .iter()
        .any(|d| d.transport == DiskTransport::Scsi);
    if needs_scsi {
        let _ = writeln!(
            x,
            "    <controller type='scsi' model='virtio-scsi' index='0'/>"
        );
    }

    for disk in &def.disks {
        let bus = match disk.transport {
            DiskTransport::Scsi => "scsi",
            DiskTransport::Blk => "virtio",
        };
        let _ = writeln!(x, "    <disk type='file' device='disk'>");
        let _ = writeln!(x, "      <driver name='qemu' type='raw'/>");
        let _ = writeln!(
            x,
            "      <source file='{}'/>",
            esc(&disk.path.to_string_lossy())
        );
        let _ = writeln!(
            x,
            "      <target dev='{}' bus='{}'/>",
            esc(&disk.target),
            bus
        );
        let _ = writeln!(x, "      <serial>{}</serial>", esc(&disk.serial));
        let _ = writeln!(x, "    </disk>");
    }

    for net in &def.nets {
        match &net.mode {
            NetMode::Bridge(name) => {
                let _ = writeln!(x, "    <interface type='bridge'>");
                let _ = writeln!(x, "      <source bridge='{}'/>", esc(name));
            }
            NetMode::Network(name) => {
                let _ = writeln!(x, "    <interface type='network'>");
                let _ = writeln!(x, "      <source network='{}'/>", esc(name));
            }
            NetMode::Ovs(name) => {
                let _ = writeln!(x, "    <interface type='bridge'>");
                let _ = writeln!(x, "      <source bridge='{}'/>", esc(name));
                let _ = writeln!(x, "      <virtualport type='openvswitch'/>");
            }
            NetMode::User => {
                let _ = writeln!(x, "    <interface type='user'>");
            }
        }
        if let Some(mac) = &net.mac {
            let _ = writeln!(x, "      <mac address='{}'/>", esc(mac));
        }
        let _ = writeln!(x, "      <model type='virtio'/>");
        let _ = writeln!(x, "    </interface>");
    }

    for share in &def.shares {
        let _ = writeln!(x, "    <filesystem type='mount' accessmode='passthrough'>");
        let _ = writeln!(
            x,
            "      <source dir='{}'/>",
            esc(&share.local.to_string_lossy())
        );
        let _ = writeln!(x, "      <target dir='{}'/>", esc(&share.tag));
        let _ = writeln!(x, "    </filesystem>");
    }

    if let Some(sock) = &def.console_sock {
        let path = esc(&sock.to_string_lossy());
        let _ = writeln!(x, "    <serial type='unix'>");
        let _ = writeln!(x, "      <source mode='bind' path='{path}'/>");
        let _ = writeln!(x, "      <target port='0'/>");
        let _ = writeln!(x, "    </serial>");
        let _ = writeln!(x, "    <console type='unix'>");
        let _ = writeln!(x, "      <source mode='bind' path='{path}'/>");
        let _ = writeln!(x, "      <target type='serial' port='0'/>");
        let _ = writeln!(x, "    </console>");
    }

    let _ = writeln!(x, "  </devices>");

    if let Some(endpoint) = &def.gdb {
        let _ = writeln!(x, "  <qemu:commandline>");
        let _ = writeln!(x, "    <qemu:arg value='-gdb'/>");
        let _ = writeln!(x, "    <qemu:arg value='tcp:{}'/>", esc(endpoint));
        let _ = writeln!(x, "  </qemu:commandline>");
    }

    let _ = writeln!(x, "</domain>");
    x
}

fn esc(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_def() -> DomainDef {
        DomainDef {
            name: "ktest-tester".to_string(),
            memory_mib: 512,
            vcpus: 2,
            kernel_path: PathBuf::from("/pool/kernel"),
            initrd_path: PathBuf::from("/pool/initramfs"),
            cmdline: "console=ttyS0".to_string(),
            disks: vec![],
            nets: vec![],
            shares: vec![],
            console_sock: None,
            gdb: None,
        }
    }

    #[test]
    fn direct_boot_elements_present() {
        let xml = domain_xml(&base_def());
        assert!(xml.contains("<name>ktest-tester</name>"));
        assert!(xml.contains("<kernel>/pool/kernel</kernel>"));
        assert!(xml.contains("<initrd>/pool/initramfs</initrd>"));
        assert!(xml.contains("<cmdline>console=ttyS0</cmdline>"));
        assert!(xml.contains("<on_crash>preserve</on_crash>"));
    }

    #[test]
    fn disk_serial_survives_unchanged() {
        let mut def = base_def();
        def.disks.push(DiskDevice {
            path: PathBuf::from("/pool/scratch"),
            serial: "scratch".to_string(),
            transport: DiskTransport::Blk,
            target: "vda".to_string(),
        });
        let xml = domain_xml(&def);
        assert!(xml.contains("<serial>scratch</serial>"));
        assert!(xml.contains("bus='virtio'"));
        assert!(!xml.contains("virtio-scsi"));
    }

    #[test]
    fn scsi_disk_gets_controller() {
        let mut def = base_def();
        def.disks.push(DiskDevice {
            path: PathBuf::from("/pool/scratch"),
            serial: "scratch".to_string(),
            transport: DiskTransport::Scsi,
            target: "sda".to_string(),
        });
        let xml = domain_xml(&def);
        assert!(xml.contains("model='virtio-scsi'"));
        assert!(xml.contains("bus='scsi'"));
    }

    #[test]
    fn network_modes_render() {
        let mut def = base_def();
        def.nets.push(NetSpec {
            mode: NetMode::Ovs("br-int".to_string()),
            mac: Some("52:54:00:12:34:56".to_string()),
            dhcp: false,
        });
        let xml = domain_xml(&def);
        assert!(xml.contains("<virtualport type='openvswitch'/>"));
        assert!(xml.contains("<mac address='52:54:00:12:34:56'/>"));
    }

    #[test]
    fn gdb_stub_renders_qemu_args() {
        let mut def = base_def();
        def.gdb = Some("localhost:1234".to_string());
        let xml = domain_xml(&def);
        assert!(xml.contains("<qemu:arg value='-gdb'/>"));
        assert!(xml.contains("<qemu:arg value='tcp:localhost:1234'/>"));
    }

    #[test]
    fn console_socket_renders() {
        let mut def = base_def();
        def.console_sock = Some(PathBuf::from("/run/ktest/console.sock"));
        let xml = domain_xml(&def);
        assert!(xml.contains("<serial type='unix'>"));
        assert!(xml.contains("path='/run/ktest/console.sock'"));
    }
}
