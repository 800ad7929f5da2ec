//! VM test-run specification.
//!
//! A [`VmSpec`] describes one session: the kernel under test, what goes
//! into the initramfs, the devices the guest sees, and the supervision
//! limits. It is assembled once from the CLI and the defaults file,
//! validated, and never mutated afterwards.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Default guest memory in MiB.
pub const DEFAULT_MEMORY_MIB: u64 = 512;
/// Default vCPU count.
pub const DEFAULT_VCPUS: u32 = 2;
/// Default run timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
/// Default kdump stabilization window in seconds.
pub const DEFAULT_KDUMP_TIMEOUT_SECS: u64 = 180;
/// Default crash drive capacity.
pub const DEFAULT_CRASHDRIVE_SIZE: &str = "5G";

/// Errors from spec parsing and validation.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid size '{0}': expected a number followed by K, M or G")]
    InvalidSize(String),

    #[error("invalid disk spec '{0}': expected NAME:<scsi|blk>:SIZE")]
    InvalidDisk(String),

    #[error("disk name '{0}' must be alphanumeric")]
    BadDiskName(String),

    #[error("duplicate disk name '{0}'")]
    DuplicateDisk(String),

    #[error("invalid net spec '{0}': expected <bridge=NAME|network=NAME|ovs=NAME|user>[:mac=ADDR][:dhcp]")]
    InvalidNet(String),

    #[error("invalid directory spec '{0}': expected LOCAL:REMOTE")]
    InvalidMount(String),

    #[error("{0}")]
    Invalid(String),
}

/// Parse a size with a binary K/M/G suffix into bytes.
///
/// Any other unit, a missing suffix, or a zero size is rejected.
pub fn parse_size(s: &str) -> Result<u64, SpecError> {
    let s = s.trim();
    let Some(suffix) = s.chars().last() else {
        return Err(SpecError::InvalidSize(s.to_string()));
    };
    let digits = &s[..s.len() - suffix.len_utf8()];
    let multiplier: u64 = match suffix {
        'K' => 1024,
        'M' => 1024 * 1024,
        'G' => 1024 * 1024 * 1024,
        _ => return Err(SpecError::InvalidSize(s.to_string())),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| SpecError::InvalidSize(s.to_string()))?;
    if value == 0 {
        return Err(SpecError::InvalidSize(s.to_string()));
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| SpecError::InvalidSize(s.to_string()))
}

/// Disk bus the guest sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskTransport {
    /// virtio-scsi, guest devices sda, sdb, ...
    Scsi,
    /// virtio-blk, guest devices vda, vdb, ...
    Blk,
}

/// One scratch disk attached to the guest.
///
/// The name doubles as the disk serial and is surfaced to the guest
/// unchanged, so guest-side tooling can find disks by name instead of
/// by device ordering.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub name: String,
    pub transport: DiskTransport,
    pub size: u64,
}

impl FromStr for DiskSpec {
    type Err = SpecError;

    /// Parse `NAME:<scsi|blk>:SIZE`.
    fn from_str(s: &str) -> Result<Self, SpecError> {
        let mut parts = s.split(':');
        let (name, transport, size) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(n), Some(t), Some(sz), None) => (n, t, sz),
            _ => return Err(SpecError::InvalidDisk(s.to_string())),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SpecError::BadDiskName(name.to_string()));
        }
        let transport = match transport {
            "scsi" => DiskTransport::Scsi,
            "blk" => DiskTransport::Blk,
            _ => return Err(SpecError::InvalidDisk(s.to_string())),
        };
        Ok(DiskSpec {
            name: name.to_string(),
            transport,
            size: parse_size(size)?,
        })
    }
}

/// How a guest NIC attaches to the host. Exactly one mode per NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetMode {
    Bridge(String),
    Network(String),
    Ovs(String),
    User,
}

/// One virtio-net interface.
#[derive(Debug, Clone)]
pub struct NetSpec {
    pub mode: NetMode,
    pub mac: Option<String>,
    pub dhcp: bool,
}

impl FromStr for NetSpec {
    type Err = SpecError;

    /// Parse `<bridge=NAME|network=NAME|ovs=NAME|user>[:mac=ADDR][:dhcp]`.
    ///
    /// The MAC address itself contains colons, so the tail is matched
    /// structurally rather than split on ':'.
    fn from_str(s: &str) -> Result<Self, SpecError> {
        let (head, mut rest) = match s.split_once(':') {
            Some((head, rest)) => (head, Some(rest)),
            None => (s, None),
        };
        let mode = match head {
            "user" => NetMode::User,
            _ => match head.split_once('=') {
                Some(("bridge", name)) if !name.is_empty() => NetMode::Bridge(name.to_string()),
                Some(("network", name)) if !name.is_empty() => NetMode::Network(name.to_string()),
                Some(("ovs", name)) if !name.is_empty() => NetMode::Ovs(name.to_string()),
                _ => return Err(SpecError::InvalidNet(s.to_string())),
            },
        };
        let mut mac = None;
        let mut dhcp = false;
        if let Some(tail) = rest.take() {
            let tail = match tail.strip_suffix(":dhcp") {
                Some(stripped) => {
                    dhcp = true;
                    stripped
                }
                None if tail == "dhcp" => {
                    dhcp = true;
                    ""
                }
                None => tail,
            };
            if !tail.is_empty() {
                match tail.strip_prefix("mac=") {
                    Some(addr) if !addr.is_empty() => mac = Some(addr.to_string()),
                    _ => return Err(SpecError::InvalidNet(s.to_string())),
                }
            }
        }
        Ok(NetSpec { mode, mac, dhcp })
    }
}

/// A file or directory copied into the initramfs.
#[derive(Debug, Clone)]
pub struct IncludeEntry {
    pub source: PathBuf,
    /// Destination inside the initramfs; defaults to the source's base name.
    pub dest: Option<String>,
}

impl FromStr for IncludeEntry {
    type Err = SpecError;

    /// Parse `SRC[:DST]`.
    fn from_str(s: &str) -> Result<Self, SpecError> {
        let (source, dest) = match s.split_once(':') {
            Some((src, dst)) if !src.is_empty() && !dst.is_empty() => {
                (src, Some(dst.to_string()))
            }
            Some(_) => return Err(SpecError::Invalid(format!("invalid include spec '{s}'"))),
            None if !s.is_empty() => (s, None),
            None => return Err(SpecError::Invalid("empty include spec".to_string())),
        };
        Ok(IncludeEntry {
            source: PathBuf::from(source),
            dest,
        })
    }
}

/// A host directory shared into the guest over 9p.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub local: PathBuf,
    pub remote: String,
}

impl FromStr for MountEntry {
    type Err = SpecError;

    /// Parse `LOCAL:REMOTE`.
    fn from_str(s: &str) -> Result<Self, SpecError> {
        match s.split_once(':') {
            Some((local, remote)) if !local.is_empty() && !remote.is_empty() => Ok(MountEntry {
                local: PathBuf::from(local),
                remote: remote.to_string(),
            }),
            _ => Err(SpecError::InvalidMount(s.to_string())),
        }
    }
}

/// Immutable description of one test run.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Kernel image to boot.
    pub kernel: PathBuf,
    /// Kernel modules to install into the initramfs, in request order.
    pub modules: Vec<String>,
    /// Programs to install into the initramfs with their libraries.
    pub programs: Vec<PathBuf>,
    /// Extra files/directories copied into the initramfs.
    pub includes: Vec<IncludeEntry>,
    /// Host directories shared into the guest.
    pub mounts: Vec<MountEntry>,
    /// Scratch disks.
    pub disks: Vec<DiskSpec>,
    /// Network interfaces.
    pub nets: Vec<NetSpec>,
    /// Guest memory in MiB.
    pub memory_mib: u64,
    /// vCPU count.
    pub vcpus: u32,
    /// Extra kernel command-line options, ordered, keys may repeat.
    pub kernel_opts: Vec<String>,
    /// Executable run by init after setup; interactive shell when absent.
    pub entry_point: Option<String>,
    /// QEMU gdb stub endpoint, `HOST:PORT`.
    pub gdb: Option<String>,
    /// Run timeout in seconds.
    pub timeout_secs: u64,
    /// Crash-dump stabilization window in seconds.
    pub kdump_timeout_secs: u64,
    /// Skip crash-drive provisioning and guest kdump setup.
    pub disable_kdump: bool,
    /// Crash drive capacity in bytes.
    pub crashdrive_size: u64,
    /// Session owner, part of every domain and volume name.
    pub owner: String,
    /// Storage pool holding session volumes.
    pub pool: String,
    /// Remove kernel/initramfs volumes and the domain after the run.
    pub clean_on_exit: bool,
    /// Leave the domain and volumes in place after a completed run.
    pub keep: bool,
    /// Preempt a conflicting running session instead of failing.
    pub force: bool,
    /// Do not write a console transcript.
    pub disable_console: bool,
    /// Module search root (modules.dep lives here).
    pub kmoddir: Option<PathBuf>,
    /// Firmware search root.
    pub fwdir: Option<PathBuf>,
    /// Directory for console transcript and kdump artifacts.
    pub output_dir: Option<PathBuf>,
}

impl VmSpec {
    /// Name of the domain this session defines.
    pub fn domain_name(&self) -> String {
        format!("ktest-{}", self.owner)
    }

    /// Validate cross-field invariants. Runs before anything touches
    /// the hypervisor, so a malformed spec creates zero resources.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.memory_mib == 0 {
            return Err(SpecError::Invalid("memory must be > 0".to_string()));
        }
        if self.vcpus == 0 {
            return Err(SpecError::Invalid("vcpu count must be > 0".to_string()));
        }
        if self.owner.is_empty() {
            return Err(SpecError::Invalid("owner must not be empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for disk in &self.disks {
            if disk.size == 0 {
                return Err(SpecError::InvalidSize(format!("{}: 0", disk.name)));
            }
            if !seen.insert(disk.name.as_str()) {
                return Err(SpecError::DuplicateDisk(disk.name.clone()));
            }
            if disk.name == crate::pool::CRASHDRIVE_SERIAL && !self.disable_kdump {
                return Err(SpecError::Invalid(format!(
                    "disk name '{}' is reserved for the crash drive",
                    disk.name
                )));
            }
        }
        if !self.modules.is_empty() && self.kmoddir.is_none() {
            return Err(SpecError::Invalid(
                "--kmoddir is required when modules are requested".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1K", 1024)]
    #[case("4M", 4 * 1024 * 1024)]
    #[case("2G", 2 * 1024 * 1024 * 1024)]
    fn parse_size_accepts_binary_suffixes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_size(input).unwrap(), expected);
    }

    #[rstest]
    #[case("512")]
    #[case("1T")]
    #[case("1g")]
    #[case("G")]
    #[case("0G")]
    #[case("")]
    fn parse_size_rejects_other_units(#[case] input: &str) {
        assert!(matches!(parse_size(input), Err(SpecError::InvalidSize(_))));
    }

    #[test]
    fn disk_spec_parses() {
        let disk: DiskSpec = "scratch:blk:1G".parse().unwrap();
        assert_eq!(disk.name, "scratch");
        assert_eq!(disk.transport, DiskTransport::Blk);
        assert_eq!(disk.size, 1024 * 1024 * 1024);
    }

    #[rstest]
    #[case("scratch:ide:1G")]
    #[case("scratch:blk")]
    #[case("scratch:blk:1G:extra")]
    fn disk_spec_rejects_malformed(#[case] input: &str) {
        assert!(input.parse::<DiskSpec>().is_err());
    }

    #[test]
    fn disk_spec_rejects_non_alphanumeric_name() {
        let err = "my-disk:blk:1G".parse::<DiskSpec>().unwrap_err();
        assert!(matches!(err, SpecError::BadDiskName(_)));
    }

    #[test]
    fn net_spec_parses_modes() {
        let net: NetSpec = "bridge=br0:mac=52:54:00:12:34:56".parse().unwrap();
        assert_eq!(net.mode, NetMode::Bridge("br0".to_string()));
        assert_eq!(net.mac.as_deref(), Some("52:54:00:12:34:56"));
        assert!(!net.dhcp);

        let net: NetSpec = "user".parse().unwrap();
        assert_eq!(net.mode, NetMode::User);

        let net: NetSpec = "network=default:dhcp".parse().unwrap();
        assert_eq!(net.mode, NetMode::Network("default".to_string()));
        assert!(net.dhcp);

        let net: NetSpec = "ovs=br-int:mac=52:54:00:12:34:56:dhcp".parse().unwrap();
        assert_eq!(net.mode, NetMode::Ovs("br-int".to_string()));
        assert_eq!(net.mac.as_deref(), Some("52:54:00:12:34:56"));
        assert!(net.dhcp);
    }

    #[test]
    fn net_spec_rejects_unknown_mode() {
        assert!("tap=tap0".parse::<NetSpec>().is_err());
        assert!("bridge=".parse::<NetSpec>().is_err());
    }

    #[test]
    fn include_entry_defaults_destination() {
        let inc: IncludeEntry = "/etc/hosts".parse().unwrap();
        assert!(inc.dest.is_none());
        let inc: IncludeEntry = "/etc/hosts:etc/hosts".parse().unwrap();
        assert_eq!(inc.dest.as_deref(), Some("etc/hosts"));
    }

    fn minimal_spec() -> VmSpec {
        VmSpec {
            kernel: PathBuf::from("bzImage"),
            modules: vec![],
            programs: vec![],
            includes: vec![],
            mounts: vec![],
            disks: vec![],
            nets: vec![],
            memory_mib: DEFAULT_MEMORY_MIB,
            vcpus: DEFAULT_VCPUS,
            kernel_opts: vec![],
            entry_point: None,
            gdb: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            kdump_timeout_secs: DEFAULT_KDUMP_TIMEOUT_SECS,
            disable_kdump: false,
            crashdrive_size: 5 * 1024 * 1024 * 1024,
            owner: "tester".to_string(),
            pool: "default".to_string(),
            clean_on_exit: true,
            keep: false,
            force: false,
            disable_console: false,
            kmoddir: None,
            fwdir: None,
            output_dir: None,
        }
    }

    #[test]
    fn validate_accepts_minimal_spec() {
        assert!(minimal_spec().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_disk_names() {
        let mut spec = minimal_spec();
        spec.disks = vec![
            "scratch:blk:1G".parse().unwrap(),
            "scratch:scsi:1G".parse().unwrap(),
        ];
        assert!(matches!(
            spec.validate(),
            Err(SpecError::DuplicateDisk(name)) if name == "scratch"
        ));
    }

    #[test]
    fn validate_rejects_zero_memory() {
        let mut spec = minimal_spec();
        spec.memory_mib = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_requires_kmoddir_for_modules() {
        let mut spec = minimal_spec();
        spec.modules = vec!["virtio_net".to_string()];
        assert!(spec.validate().is_err());
        spec.kmoddir = Some(PathBuf::from("/lib/modules/test"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn domain_name_embeds_owner() {
        assert_eq!(minimal_spec().domain_name(), "ktest-tester");
    }
}
